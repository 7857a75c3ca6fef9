// push/frame.rs - wire frames exchanged over the push channel
//
// The wire tags every frame `task_event`; the three event kinds
// (`task_created`/`task_updated`/`task_deleted`) are carried as an
// inner `event` discriminant rather than three separate `type` tags.

use crate::model::{Task, TaskId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventKind {
    Created,
    Updated,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Subscribe { projects: Vec<String> },
    Unsubscribe { projects: Vec<String> },
    TaskEvent {
        event: TaskEventKind,
        project: String,
        id: TaskId,
        /// Full snapshot for `created`/`updated`; absent for `deleted`.
        #[serde(skip_serializing_if = "Option::is_none", default)]
        task: Option<Task>,
    },
    Ping,
    Pong,
}

impl Frame {
    pub fn to_text(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_text(text: &str) -> crate::error::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Priority;
    use chrono::Utc;

    #[test]
    fn subscribe_round_trips() {
        let frame = Frame::Subscribe { projects: vec!["inbox".into(), "work".into()] };
        let text = frame.to_text().unwrap();
        assert_eq!(Frame::from_text(&text).unwrap(), frame);
    }

    #[test]
    fn task_created_round_trips_with_snapshot() {
        let now = Utc::now();
        let task = Task::new("inbox", "do it", Priority::Medium, now);
        let frame = Frame::TaskEvent {
            event: TaskEventKind::Created,
            project: "inbox".into(),
            id: task.id,
            task: Some(task),
        };
        let text = frame.to_text().unwrap();
        assert_eq!(Frame::from_text(&text).unwrap(), frame);
    }

    #[test]
    fn task_deleted_carries_no_snapshot() {
        let id = TaskId::new();
        let frame = Frame::TaskEvent { event: TaskEventKind::Deleted, project: "inbox".into(), id, task: None };
        let text = frame.to_text().unwrap();
        assert!(!text.contains("\"task\""));
        assert_eq!(Frame::from_text(&text).unwrap(), frame);
    }

    #[test]
    fn ping_and_pong_are_distinct() {
        assert_ne!(Frame::Ping.to_text().unwrap(), Frame::Pong.to_text().unwrap());
    }
}
