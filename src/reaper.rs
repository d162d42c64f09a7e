//! The async-reply reaper.
//!
//! A single worker drains the async-job queue. Each pending reply gets a
//! bounded wait; replies that are not ready in time go back to the tail of
//! the queue, so a slow handler never starves the jobs behind it and
//! completed replies overtake still-pending ones by re-circulation.

use std::{sync::Arc, time::Duration};

use crossbeam_channel::{Receiver, Sender, select};

use crate::{
    dispatch::{AsyncJob, Shared},
    handler::ReplyState,
};

/// Upper bound on one wait for a single pending reply.
pub(crate) const RESULT_POLL_WINDOW: Duration = Duration::from_millis(500);

/// Background consumer of pending async handler replies.
pub(crate) struct Reaper<T> {
    jobs: Receiver<AsyncJob<T>>,
    requeue: Sender<AsyncJob<T>>,
    stop: Receiver<()>,
    shared: Arc<Shared<T>>,
}

impl<T> Reaper<T> {
    pub(crate) fn new(
        jobs: Receiver<AsyncJob<T>>,
        requeue: Sender<AsyncJob<T>>,
        stop: Receiver<()>,
        shared: Arc<Shared<T>>,
    ) -> Self {
        Self {
            jobs,
            requeue,
            stop,
            shared,
        }
    }

    /// Consume jobs until stopped or a reply fails.
    ///
    /// A failed reply (its slot dropped uncompleted) is fatal to async
    /// processing: the reaper terminates, the job queue closes, and the
    /// reactor shuts the server down on its next async dispatch.
    pub(crate) fn run(self) {
        log::debug!("reply reaper started");
        loop {
            select! {
                recv(self.stop) -> _ => break,
                recv(self.jobs) -> job => match job {
                    Ok(job) => {
                        if !self.process(job) {
                            break;
                        }
                    }
                    Err(_) => break,
                },
            }
        }
        log::debug!("reply reaper stopped");
    }

    fn process(&self, job: AsyncJob<T>) -> bool {
        match job.pending.wait(RESULT_POLL_WINDOW) {
            ReplyState::Ready(Some(payload)) => {
                log::trace!("[client {}] async reply ready", job.id);
                self.shared.deliver(job.id, job.message.value(), payload);
                true
            }
            ReplyState::Ready(None) => {
                log::trace!("[client {}] async handler chose not to respond", job.id);
                true
            }
            ReplyState::TimedOut => {
                log::trace!(
                    "[client {}] reply not ready within {RESULT_POLL_WINDOW:?}; re-queueing",
                    job.id
                );
                self.requeue.send(job).is_ok()
            }
            ReplyState::Failed => {
                log::error!(
                    "[client {}] pending reply dropped without completing; async handling stops",
                    job.id
                );
                false
            }
        }
    }
}
