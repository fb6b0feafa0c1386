//! Cross-thread deferred callbacks.
//!
//! The only piece of the engine that other threads may touch. Callbacks are
//! appended under a lock to the current queue; the loop thread swaps that
//! queue with an empty one and runs the batch without holding the lock.
//!
//! ```text
//!   other threads ──defer(f)──► [ current ]  (Mutex)
//!                                    │ swap at run_deferred
//!   loop thread   ◄──── run ─── [ batch ]   (no lock held)
//! ```

use std::fmt;
use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;

/// A callback run on the loop thread with the loop's context.
pub type Deferred<C> = Box<dyn FnOnce(&mut C) + Send>;

type Wakeup = Box<dyn Fn() + Send + Sync>;

struct Shared<C> {
    current: Mutex<Vec<Deferred<C>>>,
    wakeup: Option<Wakeup>,
}

/// Loop-side end of the queue.
pub struct DeferQueue<C> {
    shared: Arc<Shared<C>>,
    spare: Vec<Deferred<C>>,
}

/// Cloneable, `Send` handle for posting callbacks to the loop.
pub struct LoopHandle<C> {
    shared: Arc<Shared<C>>,
}

impl<C> Clone for LoopHandle<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C> fmt::Debug for LoopHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle").finish_non_exhaustive()
    }
}

impl<C> fmt::Debug for DeferQueue<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferQueue")
            .field("pending", &self.pending())
            .finish()
    }
}

impl<C> Default for DeferQueue<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> DeferQueue<C> {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// `wakeup` runs on the posting thread after every `defer`, typically
    /// to poke the loop's poller.
    pub fn with_wakeup<W>(wakeup: W) -> Self
    where
        W: Fn() + Send + Sync + 'static,
    {
        Self::build(Some(Box::new(wakeup)))
    }

    fn build(wakeup: Option<Wakeup>) -> Self {
        Self {
            shared: Arc::new(Shared {
                current: Mutex::new(Vec::new()),
                wakeup,
            }),
            spare: Vec::new(),
        }
    }

    pub fn handle(&self) -> LoopHandle<C> {
        LoopHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Callbacks waiting for the next `run_deferred`.
    pub fn pending(&self) -> usize {
        self.shared.current.lock().len()
    }

    /// Swap out the current queue. Hand the vector back with [`recycle`]
    /// once it has been run.
    ///
    /// [`recycle`]: DeferQueue::recycle
    pub fn take_batch(&mut self) -> Vec<Deferred<C>> {
        let mut batch = std::mem::take(&mut self.spare);
        std::mem::swap(&mut *self.shared.current.lock(), &mut batch);
        batch
    }

    pub fn recycle(&mut self, mut batch: Vec<Deferred<C>>) {
        batch.clear();
        self.spare = batch;
    }

    /// Run everything posted so far, in posting order. Callbacks posted while
    /// the batch runs wait for the next call.
    pub fn run_deferred(&mut self, ctx: &mut C) -> usize {
        let mut batch = self.take_batch();
        let count = batch.len();
        for callback in batch.drain(..) {
            callback(ctx);
        }
        self.recycle(batch);
        if count > 0 {
            trace!("ran {} deferred callbacks", count);
        }
        count
    }
}

impl<C> LoopHandle<C> {
    /// Queue `callback` to run on the loop thread.
    pub fn defer<F>(&self, callback: F)
    where
        F: FnOnce(&mut C) + Send + 'static,
    {
        self.shared.current.lock().push(Box::new(callback));
        if let Some(wakeup) = &self.shared.wakeup {
            wakeup();
        }
    }
}
