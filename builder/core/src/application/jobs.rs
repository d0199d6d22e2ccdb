// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Push Job Tracker
//!
//! Bridges an asynchronous transfer to the progress-streaming RPC. The push
//! handler registers a job keyed by image name before bytes move and feeds
//! it through [`JobHandle`]; a progress stream attaches with
//! [`JobTracker::attach`] and drains the feed until the producer finishes.
//!
//! A job stays registered until its producer finishes. Whichever side lets
//! go last removes it: the feed if it drains to the end, the producer if the
//! observer disconnected first. A finished job nobody attached to is reaped
//! after the grace period.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::domain::agent_config::ProgressConfig;
use crate::domain::progress::ProgressEvent;
use crate::domain::transfer::ProgressReporter;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum JobError {
    #[error("transfer already in progress")]
    InProgress(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSettings {
    /// How long an attach waits for its job to appear, and how long an
    /// unobserved finished job is kept
    pub grace_period: Duration,
    pub poll_interval: Duration,
}

impl Default for ProgressSettings {
    fn default() -> Self {
        Self::from(&ProgressConfig::default())
    }
}

impl From<&ProgressConfig> for ProgressSettings {
    fn from(config: &ProgressConfig) -> Self {
        Self {
            grace_period: config.grace_period(),
            poll_interval: config.poll_interval(),
        }
    }
}

struct PushJob {
    feed: Mutex<Option<mpsc::UnboundedReceiver<ProgressEvent>>>,
    attached: AtomicBool,
    detached: AtomicBool,
    finished: AtomicBool,
}

impl PushJob {
    fn new(feed: mpsc::UnboundedReceiver<ProgressEvent>) -> Self {
        metrics::gauge!("kiln_push_jobs_active").increment(1.0);
        Self {
            feed: Mutex::new(Some(feed)),
            attached: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        }
    }
}

impl Drop for PushJob {
    fn drop(&mut self) {
        metrics::gauge!("kiln_push_jobs_active").decrement(1.0);
    }
}

/// Process-scoped registry of in-flight pushes.
#[derive(Clone)]
pub struct JobTracker {
    jobs: Arc<DashMap<String, Arc<PushJob>>>,
    settings: ProgressSettings,
}

impl JobTracker {
    pub fn new(settings: ProgressSettings) -> Self {
        Self {
            jobs: Arc::new(DashMap::new()),
            settings,
        }
    }

    pub fn settings(&self) -> ProgressSettings {
        self.settings
    }

    /// Register a job for `name`. Fails while another producer for the same
    /// name is still running; a finished predecessor is replaced.
    pub fn register(&self, name: &str) -> Result<JobHandle, JobError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let job = Arc::new(PushJob::new(rx));
        match self.jobs.entry(name.to_string()) {
            Entry::Occupied(entry) if !entry.get().finished.load(Ordering::SeqCst) => {
                return Err(JobError::InProgress(name.to_string()));
            }
            Entry::Occupied(mut entry) => {
                entry.insert(job.clone());
            }
            Entry::Vacant(entry) => {
                entry.insert(job.clone());
            }
        }
        debug!(image = %name, "Registered push job");
        Ok(JobHandle {
            name: name.to_string(),
            job,
            sender: Some(tx),
            tracker: self.clone(),
        })
    }

    /// Wait up to the grace period for a job named `name`, then take its
    /// feed. Returns `None` when no job shows up or another observer already
    /// holds the feed.
    pub async fn attach(&self, name: &str) -> Option<ProgressFeed> {
        let deadline = tokio::time::Instant::now() + self.settings.grace_period;
        loop {
            if let Some(job) = self.jobs.get(name).map(|entry| entry.value().clone()) {
                let Some(receiver) = job.feed.lock().take() else {
                    debug!(image = %name, "Push job already observed");
                    return None;
                };
                job.attached.store(true, Ordering::SeqCst);
                debug!(image = %name, "Attached to push job");
                return Some(ProgressFeed {
                    name: name.to_string(),
                    job,
                    receiver,
                    tracker: self.clone(),
                });
            }
            if tokio::time::Instant::now() >= deadline {
                debug!(image = %name, "No push job within grace period");
                return None;
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.jobs.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn remove(&self, name: &str, job: &Arc<PushJob>) {
        if self
            .jobs
            .remove_if(name, |_, current| Arc::ptr_eq(current, job))
            .is_some()
        {
            debug!(image = %name, "Removed push job");
        }
    }

    fn schedule_reap(&self, name: String, job: Arc<PushJob>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.remove(&name, &job);
            return;
        };
        let tracker = self.clone();
        let grace = self.settings.grace_period;
        runtime.spawn(async move {
            tokio::time::sleep(grace).await;
            if !job.attached.load(Ordering::SeqCst) {
                tracker.remove(&name, &job);
            }
        });
    }
}

/// Producer side of a job; reports progress into the feed. Dropping the
/// handle marks the job finished and closes the feed.
pub struct JobHandle {
    name: String,
    job: Arc<PushJob>,
    sender: Option<mpsc::UnboundedSender<ProgressEvent>>,
    tracker: JobTracker,
}

impl JobHandle {
    pub fn finish(self) {}
}

impl ProgressReporter for JobHandle {
    fn report(&self, event: ProgressEvent) {
        if let Some(sender) = &self.sender {
            // No receiver means the observer went away; progress is dropped.
            let _ = sender.send(event);
        }
    }
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        self.sender.take();
        self.job.finished.store(true, Ordering::SeqCst);
        if !self.job.attached.load(Ordering::SeqCst) {
            self.tracker.schedule_reap(self.name.clone(), self.job.clone());
        } else if self.job.detached.load(Ordering::SeqCst) {
            self.tracker.remove(&self.name, &self.job);
        }
    }
}

/// Observer side of a job. Dropping it removes a finished job; a running one
/// stays registered until its producer finishes.
pub struct ProgressFeed {
    name: String,
    job: Arc<PushJob>,
    receiver: mpsc::UnboundedReceiver<ProgressEvent>,
    tracker: JobTracker,
}

impl ProgressFeed {
    /// Next batch of events; everything already queued is coalesced into
    /// one batch. `None` once the producer finished and the feed drained.
    pub async fn next_batch(&mut self) -> Option<Vec<ProgressEvent>> {
        let first = self.receiver.recv().await?;
        let mut batch = vec![first];
        while let Ok(event) = self.receiver.try_recv() {
            batch.push(event);
        }
        Some(batch)
    }
}

impl Drop for ProgressFeed {
    fn drop(&mut self) {
        self.job.detached.store(true, Ordering::SeqCst);
        if self.job.finished.load(Ordering::SeqCst) {
            self.tracker.remove(&self.name, &self.job);
        } else {
            debug!(image = %self.name, "Observer left running push job");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::progress::TransferState;
    use chrono::Utc;

    fn event(reference: &str, offset: i64) -> ProgressEvent {
        let now = Utc::now();
        ProgressEvent {
            reference: reference.into(),
            state: TransferState::Uploading,
            offset,
            total: 10,
            started_at: now,
            updated_at: now,
        }
    }

    fn tracker() -> JobTracker {
        JobTracker::new(ProgressSettings {
            grace_period: Duration::from_secs(15),
            poll_interval: Duration::from_millis(100),
        })
    }

    #[tokio::test]
    async fn test_second_push_rejected_while_running() {
        let tracker = tracker();
        let handle = tracker.register("app:v1").unwrap();
        assert!(matches!(
            tracker.register("app:v1"),
            Err(JobError::InProgress(name)) if name == "app:v1"
        ));
        drop(handle);
        // A finished, unobserved predecessor is replaced.
        assert!(tracker.register("app:v1").is_ok());
    }

    #[tokio::test]
    async fn test_feed_relays_until_producer_finishes() {
        let tracker = tracker();
        let handle = tracker.register("app:v1").unwrap();
        handle.report(event("layer-a", 0));
        handle.report(event("layer-a", 10));

        let mut feed = tracker.attach("app:v1").await.unwrap();
        assert!(tracker.attach("app:v1").await.is_none());

        let batch = feed.next_batch().await.unwrap();
        assert_eq!(batch.len(), 2);
        handle.finish();
        assert!(feed.next_batch().await.is_none());

        drop(feed);
        assert!(!tracker.contains("app:v1"));
    }

    #[tokio::test]
    async fn test_disconnected_observer_keeps_running_job_registered() {
        let tracker = tracker();
        let handle = tracker.register("app:v1").unwrap();
        let feed = tracker.attach("app:v1").await.unwrap();
        drop(feed);

        assert!(tracker.contains("app:v1"));
        assert!(matches!(
            tracker.register("app:v1"),
            Err(JobError::InProgress(_))
        ));

        handle.finish();
        assert!(!tracker.contains("app:v1"));
        assert!(tracker.register("app:v1").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_waits_for_late_registration() {
        let tracker = tracker();
        let producer = tracker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            let handle = producer.register("app:v1").unwrap();
            handle.report(event("manifest", 5));
        });

        let mut feed = tracker.attach("app:v1").await.unwrap();
        let batch = feed.next_batch().await.unwrap();
        assert_eq!(batch[0].offset, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_gives_up_after_grace_period() {
        let tracker = tracker();
        let started = tokio::time::Instant::now();
        assert!(tracker.attach("missing:v1").await.is_none());
        assert!(started.elapsed() >= Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unobserved_job_is_reaped() {
        let tracker = tracker();
        tracker.register("app:v1").unwrap().finish();
        assert!(tracker.contains("app:v1"));

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert!(tracker.is_empty());
    }
}
