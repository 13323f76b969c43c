//! Fixed-capacity sample buffer shared by the decode and analysis threads.
//!
//! The producer blocks while the buffer is full and the consumer blocks while
//! it is empty. `reset` and `close` wake every waiter so a seek or a cancel
//! never leaves a thread parked on the condition variables.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::error::QueueError;

/// Identifies the stream segment buffered data belongs to.
///
/// Every reset starts a new epoch; `start` is the stream position (in
/// samples at the analysis rate) of the first sample of that epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Epoch {
    pub id: u64,
    pub start: u64,
}

#[derive(Debug)]
struct State {
    buf: VecDeque<f32>,
    eof: bool,
    closed: bool,
    epoch: Epoch,
}

#[derive(Debug)]
pub struct BoundedSampleQueue {
    capacity: usize,
    state: Mutex<State>,
    readable: Condvar,
    writable: Condvar,
}

impl BoundedSampleQueue {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        Self {
            capacity,
            state: Mutex::new(State {
                buf: VecDeque::with_capacity(capacity),
                eof: false,
                closed: false,
                epoch: Epoch::default(),
            }),
            readable: Condvar::new(),
            writable: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn epoch(&self) -> Epoch {
        self.lock().epoch
    }

    /// Appends `samples`, blocking until there is room for all of them.
    ///
    /// The write is all-or-nothing. A push larger than the capacity fails
    /// immediately; a push that is waiting when the queue is reset or closed
    /// is abandoned and reports why.
    pub fn push(&self, samples: &[f32]) -> Result<(), QueueError> {
        if samples.len() > self.capacity {
            return Err(QueueError::Oversized {
                len: samples.len(),
                capacity: self.capacity,
            });
        }
        let mut st = self.lock();
        let epoch = st.epoch.id;
        loop {
            if st.closed {
                return Err(QueueError::Closed);
            }
            if st.epoch.id != epoch {
                return Err(QueueError::Reset);
            }
            if self.capacity - st.buf.len() >= samples.len() {
                break;
            }
            st = self
                .writable
                .wait(st)
                .unwrap_or_else(PoisonError::into_inner);
        }
        st.buf.extend(samples.iter().copied());
        self.readable.notify_all();
        Ok(())
    }

    /// Moves everything currently buffered into `out`.
    ///
    /// Blocks until data is available or the queue is reset. Returns `false`
    /// only once end of stream has been signalled and the buffer is drained,
    /// or the queue has been closed. A `true` return appended at least one
    /// sample, unless a reset woke the call, in which case nothing was
    /// appended.
    pub fn pop_available(&self, out: &mut Vec<f32>) -> bool {
        self.pop_tagged(out).is_some()
    }

    /// Like [`pop_available`](Self::pop_available) but also reports the
    /// epoch the drained samples belong to. A reset while waiting returns
    /// the new epoch with `out` untouched.
    pub fn pop_tagged(&self, out: &mut Vec<f32>) -> Option<Epoch> {
        let mut st = self.lock();
        let entered = st.epoch.id;
        loop {
            if st.closed {
                return None;
            }
            if !st.buf.is_empty() {
                out.extend(st.buf.drain(..));
                self.writable.notify_all();
                return Some(st.epoch);
            }
            if st.epoch.id != entered {
                return Some(st.epoch);
            }
            if st.eof {
                return None;
            }
            st = self
                .readable
                .wait(st)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// No further data will arrive in the current epoch.
    pub fn set_eof(&self) {
        let mut st = self.lock();
        st.eof = true;
        self.readable.notify_all();
    }

    pub fn is_eof(&self) -> bool {
        self.lock().eof
    }

    /// Discards buffered data and starts a new epoch at stream position 0.
    pub fn reset(&self) {
        self.reset_to(0);
    }

    /// Discards buffered data and starts a new epoch at `start`.
    pub fn reset_to(&self, start: u64) {
        let mut st = self.lock();
        st.buf.clear();
        st.eof = false;
        st.epoch = Epoch {
            id: st.epoch.id + 1,
            start,
        };
        log::debug!("Sample queue reset (epoch {}, start {})", st.epoch.id, start);
        self.readable.notify_all();
        self.writable.notify_all();
    }

    /// Shuts the queue down for good; blocked and future calls return at once.
    pub fn close(&self) {
        let mut st = self.lock();
        st.closed = true;
        st.buf.clear();
        self.readable.notify_all();
        self.writable.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}
