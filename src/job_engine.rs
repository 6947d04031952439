use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A bounded queue of asynchronous jobs executed by a fixed number of worker tasks. Submitting
///  never blocks: when the queue is full, the job is rejected and the caller decides what to do.
pub struct JobEngine {
    sender: mpsc::Sender<Job>,
    receiver: Mutex<Option<mpsc::Receiver<Job>>>,
}

impl JobEngine {
    pub fn new(capacity: usize) -> JobEngine {
        let (sender, receiver) = mpsc::channel(capacity);
        JobEngine {
            sender,
            receiver: Mutex::new(Some(receiver)),
        }
    }

    /// Queues a job, returning `false` if the queue is full or the engine was shut down
    pub fn try_submit(&self, job: impl Future<Output = ()> + Send + 'static) -> bool {
        match self.sender.try_send(Box::pin(job)) {
            Ok(()) => true,
            Err(e) => {
                debug!("rejecting job: {}", e);
                false
            }
        }
    }

    /// Spawns the worker tasks. Workers finish when `shutdown` changes; jobs that were queued but
    ///  not started are dropped. Calling this more than once has no effect.
    pub fn start(&self, num_workers: usize, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let receiver = self.receiver.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(receiver) = receiver else {
            return Vec::new();
        };

        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        (0..num_workers.max(1))
            .map(|worker| {
                let receiver = receiver.clone();
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    loop {
                        let job = tokio::select! {
                            job = async { receiver.lock().await.recv().await } => job,
                            _ = shutdown.changed() => None,
                        };
                        match job {
                            Some(job) => job.await,
                            None => break,
                        }
                    }
                    trace!("job worker {} finished", worker);
                })
            })
            .collect()
    }
}
