//! Single-writer admission for the document.
//!
//! Every load-modify-save cycle runs inside [`SingleWriter::run`]. Waiters
//! are admitted in arrival order (tokio's mutex queues fairly), and the slot
//! is released when the body finishes, fails, or its future is dropped.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;
use tracing::trace;

#[derive(Debug, Default)]
pub struct SingleWriter {
    slot: Mutex<()>,
    arrivals: AtomicU64,
    completed: AtomicU64,
}

impl SingleWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `body` with exclusive access. The result (success or error) is
    /// returned unchanged.
    pub async fn run<F, Fut, T>(&self, body: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let ticket = self.arrivals.fetch_add(1, Ordering::SeqCst);
        let _slot = self.slot.lock().await;
        trace!(ticket, "writer admitted");
        let out = body().await;
        self.completed.fetch_add(1, Ordering::SeqCst);
        out
    }

    /// Requests that have arrived, including any still waiting.
    pub fn arrivals(&self) -> u64 {
        self.arrivals.load(Ordering::SeqCst)
    }

    /// Bodies that ran to completion.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }
}
