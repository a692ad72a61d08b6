//! Job event stream for external consumers
//!
//! A broadcast-based bus publishing per-job lifecycle events. Delivery is
//! best-effort: publishing with no subscribers is not an error, and slow
//! subscribers may observe lagged receivers. The WebSocket facade (out of
//! scope here) is one subscriber; tests are another.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::scheduler::job::JobStatus;

/// Per-job lifecycle event, serialized as published to the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    #[serde(rename = "job.started")]
    Started {
        job_id: Uuid,
        status: JobStatus,
        correlation_id: Uuid,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    #[serde(rename = "job.progress")]
    Progress {
        job_id: Uuid,
        status: JobStatus,
        /// Percentage of completed actions, `(i+1)/N*100`
        percent: f64,
        completed_actions: usize,
        total_actions: usize,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    #[serde(rename = "job.completed")]
    Completed {
        job_id: Uuid,
        status: JobStatus,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    #[serde(rename = "job.failed")]
    Failed {
        job_id: Uuid,
        status: JobStatus,
        error: String,
        will_retry: bool,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    #[serde(rename = "job.cancelled")]
    Cancelled {
        job_id: Uuid,
        status: JobStatus,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl JobEvent {
    #[must_use]
    pub fn job_id(&self) -> Uuid {
        match self {
            Self::Started { job_id, .. }
            | Self::Progress { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Failed { job_id, .. }
            | Self::Cancelled { job_id, .. } => *job_id,
        }
    }

    #[must_use]
    pub fn started(job_id: Uuid, correlation_id: Uuid) -> Self {
        Self::Started {
            job_id,
            status: JobStatus::Processing,
            correlation_id,
            timestamp: chrono::Utc::now(),
        }
    }

    #[must_use]
    pub fn progress(job_id: Uuid, completed_actions: usize, total_actions: usize) -> Self {
        let percent = if total_actions == 0 {
            100.0
        } else {
            completed_actions as f64 / total_actions as f64 * 100.0
        };
        Self::Progress {
            job_id,
            status: JobStatus::Processing,
            percent,
            completed_actions,
            total_actions,
            timestamp: chrono::Utc::now(),
        }
    }

    #[must_use]
    pub fn completed(job_id: Uuid) -> Self {
        Self::Completed {
            job_id,
            status: JobStatus::Completed,
            timestamp: chrono::Utc::now(),
        }
    }

    #[must_use]
    pub fn failed(job_id: Uuid, error: &str, will_retry: bool) -> Self {
        Self::Failed {
            job_id,
            status: if will_retry { JobStatus::Pending } else { JobStatus::Failed },
            error: error.to_string(),
            will_retry,
            timestamp: chrono::Utc::now(),
        }
    }

    #[must_use]
    pub fn cancelled(job_id: Uuid) -> Self {
        Self::Cancelled {
            job_id,
            status: JobStatus::Cancelled,
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Broadcast bus for [`JobEvent`]s.
#[derive(Debug)]
pub struct JobEventBus {
    sender: broadcast::Sender<JobEvent>,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl JobEventBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Subscribe to the event stream from this point forward.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }

    /// Publish an event, best-effort.
    ///
    /// Returns the number of subscribers that received it. Zero subscribers
    /// is normal during startup and in tests.
    pub fn publish(&self, event: JobEvent) -> usize {
        match self.sender.send(event) {
            Ok(receivers) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                receivers
            }
            Err(err) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(job_id = %err.0.job_id(), "No subscribers for job event");
                0
            }
        }
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    #[must_use]
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for JobEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = JobEventBus::new(8);
        let mut rx = bus.subscribe();
        let job_id = Uuid::new_v4();
        assert_eq!(bus.publish(JobEvent::progress(job_id, 1, 2)), 1);

        let event = rx.recv().await.expect("event should be delivered");
        match event {
            JobEvent::Progress { percent, .. } => assert!((percent - 50.0).abs() < f64::EPSILON),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn publish_without_subscribers_is_best_effort() {
        let bus = JobEventBus::new(8);
        assert_eq!(bus.publish(JobEvent::completed(Uuid::new_v4())), 0);
        assert_eq!(bus.dropped_count(), 1);
        assert_eq!(bus.published_count(), 0);
    }

    #[test]
    fn progress_event_is_monotone_per_action() {
        let job_id = Uuid::new_v4();
        let percents: Vec<f64> = (1..=4)
            .map(|i| match JobEvent::progress(job_id, i, 4) {
                JobEvent::Progress { percent, .. } => percent,
                _ => unreachable!(),
            })
            .collect();
        assert!(percents.windows(2).all(|w| w[0] < w[1]));
        assert!((percents[3] - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn events_serialize_with_dotted_type_tags() {
        let event = JobEvent::started(Uuid::new_v4(), Uuid::new_v4());
        let json = serde_json::to_value(&event).expect("event serializes");
        assert_eq!(json["type"], "job.started");
    }
}
