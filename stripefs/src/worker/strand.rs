//! Per-file execution strands.
//!
//! Every file id gets at most one strand in a worker. Tasks posted to a
//! strand run to completion in submission order, one at a time, on the
//! shared runtime; a task awaiting the network never blocks other
//! strands. Strands are created lazily and reclaimed after a quiet
//! period.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::error::SResult;
use crate::uuid::FileId;

type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

struct Strand {
    tx: mpsc::UnboundedSender<Task>,
    /// Tasks submitted but not yet finished.
    in_flight: Arc<AtomicUsize>,
    last_used: Instant,
}

/// The worker's strand registry.
pub struct StrandMap {
    strands: Mutex<HashMap<FileId, Strand>>,
}

impl StrandMap {
    pub fn new() -> Self {
        StrandMap { strands: Mutex::new(HashMap::new()) }
    }

    /// Posts a task to the file's strand, creating the strand on first
    /// reference. Tasks on one strand never run concurrently and run in
    /// submission order.
    pub fn submit<F>(&self, file: FileId, task: F) -> SResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut strands = self.strands.lock()?;
        let strand = strands.entry(file).or_insert_with(|| {
            let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
            let in_flight = Arc::new(AtomicUsize::new(0));
            let counter = in_flight.clone();
            tokio::spawn(async move {
                while let Some(task) = rx.recv().await {
                    task.await;
                    counter.fetch_sub(1, Ordering::Release);
                }
            });
            Strand { tx, in_flight, last_used: Instant::now() }
        });

        strand.last_used = Instant::now();
        strand.in_flight.fetch_add(1, Ordering::Acquire);
        if strand.tx.send(Box::pin(task)).is_err() {
            strand.in_flight.fetch_sub(1, Ordering::Release);
            // The drain task is gone; replace the strand on next submit.
            strands.remove(&file);
            return Err(crate::error::Error::Internal("strand drain task died".to_string()));
        }
        Ok(())
    }

    /// Total tasks queued or running across all strands; the control
    /// channel uses this for backpressure.
    pub fn total_in_flight(&self) -> usize {
        self.strands
            .lock()
            .map(|m| m.values().map(|s| s.in_flight.load(Ordering::Acquire)).sum())
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.strands.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops strands that have been idle (no queued or running task)
    /// for at least `ttl`. Returns how many were reclaimed.
    pub fn reclaim_idle(&self, ttl: Duration) -> usize {
        let Ok(mut strands) = self.strands.lock() else { return 0 };
        let before = strands.len();
        strands.retain(|_, s| {
            s.in_flight.load(Ordering::Acquire) > 0 || s.last_used.elapsed() < ttl
        });
        before - strands.len()
    }
}

impl Default for StrandMap {
    fn default() -> Self {
        Self::new()
    }
}
