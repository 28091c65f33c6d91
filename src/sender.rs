use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tracing::{debug, error, trace, warn};

use crate::{
    channel::{event_tx, Channel},
    message::Message,
};

/// Callback run once a queued message has been handled (sent, skipped or dropped)
pub type Completion = Box<dyn FnOnce() + Send>;

struct Job {
    message: Message,
    on_complete: Option<Completion>,
}

impl Job {
    fn complete(self) {
        if let Some(on_complete) = self.on_complete {
            on_complete();
        }
    }
}

/// Single consumer that serializes every fire-and-forget write on a channel
///
/// Each job is sent and its `EVENT_TX` awaited before the next one starts.
/// While the shared `respond` gate is closed, jobs are skipped but their
/// completion still runs.
pub struct SendWorker {
    queue: Mutex<Option<mpsc::Sender<Job>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SendWorker {
    /// Spawn the worker task
    #[must_use]
    pub fn spawn(
        channel: Arc<Channel>,
        respond: Arc<Mutex<bool>>,
        ack_timeout: Duration,
        depth: usize,
    ) -> Self {
        let (queue, mut jobs) = mpsc::channel::<Job>(depth.max(1));

        let task = tokio::spawn(async move {
            while let Some(job) = jobs.recv().await {
                let open = *respond.lock().unwrap_or_else(PoisonError::into_inner);
                if !open {
                    trace!("Responses suppressed; skipping {}", job.message);
                    job.complete();
                    continue;
                }

                if let Err(e) = channel
                    .send_and_wait_for_ack(&job.message, event_tx(), ack_timeout)
                    .await
                {
                    error!("Message send failed on channel {}: {}", channel.number(), e);
                }
                job.complete();
            }
            debug!("Send worker stopped");
        });

        Self {
            queue: Mutex::new(Some(queue)),
            task: Mutex::new(Some(task)),
        }
    }

    /// Queue a message without waiting. Returns `false` (after running
    /// `on_complete`) if the queue is full or the worker has stopped.
    pub fn submit(&self, message: Message, on_complete: Option<Completion>) -> bool {
        let job = Job {
            message,
            on_complete,
        };
        let queue = self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(queue) = queue else {
            warn!("Send worker stopped; dropping {}", job.message);
            job.complete();
            return false;
        };
        match queue.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(job)) => {
                warn!("Send queue full; dropping {}", job.message);
                job.complete();
                false
            }
            Err(TrySendError::Closed(job)) => {
                warn!("Send worker stopped; dropping {}", job.message);
                job.complete();
                false
            }
        }
    }

    /// Stop accepting jobs, let queued ones finish, then wait for the task.
    /// Later calls return immediately.
    pub async fn shutdown(&self) {
        drop(
            self.queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Send worker task failed: {}", e);
            }
        }
    }
}
