// model/task.rs - the versioned unit of sync

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

pub const MAX_CONTENT_LEN: usize = 1000;

/// Newtype around the task's globally unique, client-assigned id (I1:
/// immutable after creation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task status. The wire alias `todo` decodes to `Pending` but the
/// canonical encoding is always `pending` (DESIGN NOTES: one variant,
/// translate the legacy name on decode).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

impl Serialize for Status {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let s = match self {
            Status::Pending => "pending",
            Status::InProgress => "in_progress",
            Status::Completed => "completed",
            Status::Cancelled => "cancelled",
        };
        serializer.serialize_str(s)
    }
}

impl<'de> Deserialize<'de> for Status {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        match s.as_str() {
            "pending" | "todo" => Ok(Status::Pending),
            "in_progress" => Ok(Status::InProgress),
            "completed" => Ok(Status::Completed),
            "cancelled" => Ok(Status::Cancelled),
            other => Err(de::Error::custom(format!("unknown task status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

/// A dynamically-typed value for the free-form `metadata` bag (DESIGN
/// NOTES: model as a tagged union, not a pointer to "any object").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<MetadataValue>),
    Map(BTreeMap<String, MetadataValue>),
}

impl MetadataValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            MetadataValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            MetadataValue::Number(n) => Some(*n),
            _ => None,
        }
    }
}

/// The versioned unit of sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub project: String,
    pub content: String,
    pub status: Status,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
    pub local_version: u64,
    pub parent_id: Option<TaskId>,
    #[serde(default)]
    pub metadata: BTreeMap<String, MetadataValue>,
}

impl Task {
    /// Construct a brand-new task (local_version starts at 0; the Local
    /// Store bumps it to 1 on `Create`, matching the store's contract).
    pub fn new(project: impl Into<String>, content: impl Into<String>, priority: Priority, now: DateTime<Utc>) -> Self {
        Self {
            id: TaskId::new(),
            project: project.into(),
            content: content.into(),
            status: Status::Pending,
            priority,
            created_at: now,
            updated_at: now,
            completed_at: None,
            tags: Vec::new(),
            local_version: 0,
            parent_id: None,
            metadata: BTreeMap::new(),
        }
    }

    /// I5: content non-empty and in bounds, enums are valid by
    /// construction (Rust's type system), I2/I3 checked structurally.
    pub fn validate(&self) -> Result<()> {
        if self.content.trim().is_empty() {
            return Err(Error::Validation("content must not be empty".into()));
        }
        if self.content.chars().count() > MAX_CONTENT_LEN {
            return Err(Error::Validation(format!(
                "content exceeds {MAX_CONTENT_LEN} characters"
            )));
        }
        if self.updated_at < self.created_at {
            return Err(Error::Validation("updated_at precedes created_at".into()));
        }
        if (self.status == Status::Completed) != self.completed_at.is_some() {
            return Err(Error::Validation(
                "completed_at must be set iff status is completed".into(),
            ));
        }
        Ok(())
    }

    /// Apply a status transition, enforcing I3/I4. Returns the prior
    /// state untouched (by value) on rejection so callers can implement
    /// "validation failures leave the prior record intact" (I5) without
    /// a manual rollback path.
    pub fn with_status(&self, new_status: Status, now: DateTime<Utc>) -> Result<Task> {
        if !Self::transition_allowed(self.status, new_status) {
            return Err(Error::Validation(format!(
                "illegal transition {:?} -> {:?}",
                self.status, new_status
            )));
        }
        let mut next = self.clone();
        next.status = new_status;
        next.completed_at = match new_status {
            Status::Completed => Some(now),
            Status::Pending => None,
            _ => self.completed_at,
        };
        next.updated_at = now;
        next.local_version += 1;
        next.validate()?;
        Ok(next)
    }

    fn transition_allowed(from: Status, to: Status) -> bool {
        use Status::*;
        if from == to {
            return true;
        }
        match from {
            Completed | Cancelled => to == Pending,
            Pending => matches!(to, InProgress | Completed | Cancelled),
            InProgress => matches!(to, Completed | Cancelled | Pending),
        }
    }

    pub fn add_tag(&mut self, tag: impl Into<String>) {
        let tag = tag.into();
        if !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn new_task_validates() {
        let task = Task::new("p", "write tests", Priority::Medium, now());
        assert!(task.validate().is_ok());
    }

    #[test]
    fn empty_content_is_invalid() {
        let task = Task::new("p", "   ", Priority::Low, now());
        assert!(task.validate().is_err());
    }

    #[test]
    fn content_over_limit_is_invalid() {
        let task = Task::new("p", "a".repeat(MAX_CONTENT_LEN + 1), Priority::Low, now());
        assert!(task.validate().is_err());
    }

    #[test]
    fn completing_sets_completed_at() {
        let task = Task::new("p", "ship it", Priority::High, now());
        let completed = task.with_status(Status::Completed, now()).unwrap();
        assert!(completed.completed_at.is_some());
        assert_eq!(completed.local_version, 1);
    }

    #[test]
    fn reset_from_completed_clears_completed_at() {
        let task = Task::new("p", "ship it", Priority::High, now());
        let completed = task.with_status(Status::Completed, now()).unwrap();
        let reset = completed.with_status(Status::Pending, now()).unwrap();
        assert!(reset.completed_at.is_none());
    }

    #[test]
    fn completed_cannot_go_directly_to_cancelled() {
        let task = Task::new("p", "ship it", Priority::High, now());
        let completed = task.with_status(Status::Completed, now()).unwrap();
        assert!(completed.with_status(Status::Cancelled, now()).is_err());
    }

    #[test]
    fn cancelled_cannot_go_directly_to_in_progress() {
        let task = Task::new("p", "ship it", Priority::High, now());
        let cancelled = task.with_status(Status::Cancelled, now()).unwrap();
        assert!(cancelled.with_status(Status::InProgress, now()).is_err());
    }

    #[test]
    fn legacy_todo_alias_decodes_to_pending() {
        let status: Status = serde_json::from_str("\"todo\"").unwrap();
        assert_eq!(status, Status::Pending);
        assert_eq!(serde_json::to_string(&Status::Pending).unwrap(), "\"pending\"");
    }

    #[test]
    fn tags_preserve_insertion_order_and_set_semantics() {
        let mut task = Task::new("p", "x", Priority::Low, now());
        task.add_tag("a");
        task.add_tag("b");
        task.add_tag("a");
        assert_eq!(task.tags, vec!["a".to_string(), "b".to_string()]);
    }
}
