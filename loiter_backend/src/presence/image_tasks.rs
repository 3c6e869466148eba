//! Bounded set of in-flight image descriptions, keyed by source entry id.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use crate::transport::MessageId;

use super::session::secs_between;

struct ImageTask {
    handle: JoinHandle<String>,
    /// Timestamp of the message the image belongs to.
    source_time: DateTime<Utc>,
}

#[derive(Debug, Default, PartialEq)]
pub struct ReapOutcome {
    pub completed: Vec<(MessageId, String)>,
    pub cancelled: Vec<MessageId>,
}

pub struct ImageTasks {
    tasks: HashMap<MessageId, ImageTask>,
    cap: usize,
}

impl ImageTasks {
    pub fn new(cap: usize) -> Self {
        Self {
            tasks: HashMap::new(),
            cap,
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.tasks.contains_key(&id)
    }

    pub fn has_capacity(&self) -> bool {
        self.tasks.len() < self.cap
    }

    /// Launch a description task. Returns false (and drops the request) when
    /// the budget is exhausted or `id` is already being analyzed.
    pub fn spawn<F>(&mut self, id: MessageId, source_time: DateTime<Utc>, describe: F) -> bool
    where
        F: Future<Output = String> + Send + 'static,
    {
        if !self.has_capacity() || self.contains(id) {
            return false;
        }
        let handle = tokio::spawn(describe);
        self.tasks.insert(
            id,
            ImageTask {
                handle,
                source_time,
            },
        );
        true
    }

    /// Collect finished tasks and cancel unfinished ones whose source message
    /// is older than `stale_secs`.
    pub async fn reap(&mut self, now: DateTime<Utc>, stale_secs: f64) -> ReapOutcome {
        let mut outcome = ReapOutcome::default();

        let finished: Vec<MessageId> = self
            .tasks
            .iter()
            .filter(|(_, task)| task.handle.is_finished())
            .map(|(id, _)| *id)
            .collect();
        for id in finished {
            if let Some(task) = self.tasks.remove(&id) {
                match task.handle.await {
                    Ok(description) if !description.trim().is_empty() => {
                        outcome.completed.push((id, description))
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("Image task for message {} failed: {}", id, e),
                }
            }
        }

        let stale: Vec<MessageId> = self
            .tasks
            .iter()
            .filter(|(_, task)| secs_between(task.source_time, now) > stale_secs)
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            if let Some(task) = self.tasks.remove(&id) {
                task.handle.abort();
                outcome.cancelled.push(id);
            }
        }

        outcome
    }

    /// Wait up to `timeout` for the description of `id`. The task leaves the
    /// in-flight set either way; on timeout it is cancelled.
    pub async fn take_with_timeout(&mut self, id: MessageId, timeout: Duration) -> Option<String> {
        let mut task = self.tasks.remove(&id)?;
        match tokio::time::timeout(timeout, &mut task.handle).await {
            Ok(Ok(description)) if !description.trim().is_empty() => Some(description),
            Ok(Ok(_)) => None,
            Ok(Err(e)) => {
                tracing::warn!("Image task for message {} failed: {}", id, e);
                None
            }
            Err(_) => {
                task.handle.abort();
                tracing::debug!("Image task for message {} timed out after {:?}", id, timeout);
                None
            }
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.handle.abort();
        }
    }
}

impl Drop for ImageTasks {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
