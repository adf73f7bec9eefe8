//! Domain events and the in-process event bus.
//!
//! Background-task handlers report outcomes as [`VFolderEvent`]s through the
//! [`EventProducer`] trait. [`EventBus`] is the in-process implementation: a
//! broadcast channel whose subscribers filter by NATS-style subject patterns.
//!
//! # Subjects
//!
//! | Event | Subject |
//! |-------|---------|
//! | `DeletionSuccess` | `vfolder.deletion.success` |
//! | `DeletionFailure` | `vfolder.deletion.failure` |
//! | `CloneSuccess` | `vfolder.clone.success` |
//! | `CloneFailure` | `vfolder.clone.failure` |
//!
//! Patterns are dot-separated: `*` matches exactly one token, `>` matches one
//! or more trailing tokens. `vfolder.*.failure` receives every failure.

use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use vfproxy_types::VFolderId;

use crate::error::StorageResult;

/// Whether `subject` matches `pattern`.
pub fn matches_pattern(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.').peekable();
    let mut subject_tokens = subject.split('.');

    while let Some(token) = pattern_tokens.next() {
        match token {
            ">" => {
                return pattern_tokens.peek().is_none() && subject_tokens.next().is_some();
            }
            "*" => {
                if subject_tokens.next().is_none() {
                    return false;
                }
            }
            exact => {
                if subject_tokens.next() != Some(exact) {
                    return false;
                }
            }
        }
    }
    subject_tokens.next().is_none()
}

/// Payloads that know their subject.
pub trait HasSubject {
    fn subject(&self) -> &'static str;
}

/// Outcome of a vfolder background task.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum VFolderEvent {
    DeletionSuccess {
        vfid: VFolderId,
    },
    DeletionFailure {
        vfid: VFolderId,
        message: String,
    },
    CloneSuccess {
        src_vfid: VFolderId,
        dst_vfid: VFolderId,
    },
    CloneFailure {
        src_vfid: VFolderId,
        dst_vfid: VFolderId,
        message: String,
    },
}

impl HasSubject for VFolderEvent {
    fn subject(&self) -> &'static str {
        match self {
            Self::DeletionSuccess { .. } => "vfolder.deletion.success",
            Self::DeletionFailure { .. } => "vfolder.deletion.failure",
            Self::CloneSuccess { .. } => "vfolder.clone.success",
            Self::CloneFailure { .. } => "vfolder.clone.failure",
        }
    }
}

impl VFolderEvent {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::DeletionFailure { .. } | Self::CloneFailure { .. }
        )
    }
}

/// A published event.
#[derive(Clone, Debug)]
pub struct EventMessage {
    pub subject: &'static str,
    pub event: VFolderEvent,
    pub timestamp: SystemTime,
}

/// Sink for domain events.
#[async_trait]
pub trait EventProducer: Send + Sync {
    async fn produce_event(&self, event: VFolderEvent) -> StorageResult<()>;
}

/// Broadcast bus for [`VFolderEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EventMessage>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publish `event`; returns how many subscribers were reached.
    pub fn publish(&self, event: VFolderEvent) -> usize {
        let msg = EventMessage {
            subject: event.subject(),
            event,
            timestamp: SystemTime::now(),
        };
        self.tx.send(msg).unwrap_or(0)
    }

    pub fn subscribe(&self, pattern: &str) -> Subscription {
        Subscription {
            pattern: pattern.to_string(),
            rx: self.tx.subscribe(),
        }
    }
}

#[async_trait]
impl EventProducer for EventBus {
    async fn produce_event(&self, event: VFolderEvent) -> StorageResult<()> {
        let subject = event.subject();
        let reached = self.publish(event);
        tracing::debug!(subject, reached, "event published");
        Ok(())
    }
}

/// Pattern-filtered receiver.
pub struct Subscription {
    pattern: String,
    rx: broadcast::Receiver<EventMessage>,
}

impl Subscription {
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Next matching message; `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<EventMessage> {
        loop {
            match self.rx.recv().await {
                Ok(msg) if matches_pattern(&self.pattern, msg.subject) => return Some(msg),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(pattern = %self.pattern, lagged = n, "event subscription lagged");
                }
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<EventMessage> {
        loop {
            match self.rx.try_recv() {
                Ok(msg) if matches_pattern(&self.pattern, msg.subject) => return Some(msg),
                Ok(_) => {}
                Err(broadcast::error::TryRecvError::Empty)
                | Err(broadcast::error::TryRecvError::Closed) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    tracing::warn!(pattern = %self.pattern, lagged = n, "event subscription lagged");
                }
            }
        }
    }
}
