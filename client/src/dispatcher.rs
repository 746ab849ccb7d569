//! Single-consumer callback queue
//!
//! Network tasks never touch session state directly. They enqueue a callback
//! through a [`DispatchHandle`] from whatever task they run on, and the one
//! owner of the [`Dispatcher`] runs those callbacks against its context in
//! strict FIFO order, each to completion before the next starts.
//!
//! A callback that returns an error or panics is logged and skipped; the
//! queue keeps draining. A drain only runs what was queued when it started,
//! so callbacks that enqueue more work cannot keep it busy forever.

use crate::error::ClientError;
use log::{error, warn};
use std::panic::{self, AssertUnwindSafe};
use tokio::sync::mpsc;

pub type Callback<C> = Box<dyn FnOnce(&mut C) -> Result<(), ClientError> + Send>;

/// Enqueue side. Cheap to clone and usable from any task or thread.
pub struct DispatchHandle<C> {
    tx: mpsc::UnboundedSender<Callback<C>>,
}

impl<C> Clone for DispatchHandle<C> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<C> DispatchHandle<C> {
    /// Queues `callback`. Returns false if the dispatcher has been dropped.
    pub fn enqueue<F>(&self, callback: F) -> bool
    where
        F: FnOnce(&mut C) -> Result<(), ClientError> + Send + 'static,
    {
        self.tx.send(Box::new(callback)).is_ok()
    }
}

/// Drain side, owned by the designated context.
pub struct Dispatcher<C> {
    rx: mpsc::UnboundedReceiver<Callback<C>>,
    completed: u64,
    failed: u64,
}

impl<C> Dispatcher<C> {
    pub fn new() -> (Self, DispatchHandle<C>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                rx,
                completed: 0,
                failed: 0,
            },
            DispatchHandle { tx },
        )
    }

    /// Runs the callbacks queued at the time of the call. Anything they
    /// enqueue waits for the next drain. Returns how many ran.
    pub fn drain(&mut self, context: &mut C) -> usize {
        let pending = self.rx.len();
        let mut ran = 0;
        while ran < pending {
            match self.rx.try_recv() {
                Ok(callback) => self.run(callback, context),
                Err(_) => break,
            }
            ran += 1;
        }
        ran
    }

    /// Waits for the next callback and runs it. Returns false once every
    /// handle is dropped and the queue is empty.
    pub async fn next(&mut self, context: &mut C) -> bool {
        match self.rx.recv().await {
            Some(callback) => {
                self.run(callback, context);
                true
            }
            None => false,
        }
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }

    pub fn failed(&self) -> u64 {
        self.failed
    }

    fn run(&mut self, callback: Callback<C>, context: &mut C) {
        match panic::catch_unwind(AssertUnwindSafe(|| callback(context))) {
            Ok(Ok(())) => self.completed += 1,
            Ok(Err(ClientError::Protocol(e))) => {
                self.failed += 1;
                warn!("Dropped unreadable frame: {}", e);
            }
            Ok(Err(e)) => {
                self.failed += 1;
                error!("Dispatched callback failed: {}", e);
            }
            Err(_) => {
                self.failed += 1;
                error!("Dispatched callback panicked");
            }
        }
    }
}
