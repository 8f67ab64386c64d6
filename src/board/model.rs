//! Task board data model types.

use serde::{Deserialize, Serialize};

use crate::board::error::BoardError;

/// Board column names. A task title may never equal one of these —
/// columns and task cards share the same drag surface in clients.
pub const RESERVED_TITLES: [&str; 3] = ["Todo", "In Progress", "Done"];

/// Generate a new UUID v4 string.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Current time as an RFC 3339 string (the storage timestamp format).
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

// ─── Workflow enums ──────────────────────────────────────────────────────────

/// Workflow state of a task. `Todo` and `In Progress` are the active
/// subset counted by smart-assign; `Done` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Todo,
    #[serde(rename = "In Progress")]
    InProgress,
    Done,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Todo => "Todo",
            TaskStatus::InProgress => "In Progress",
            TaskStatus::Done => "Done",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Todo" => Some(TaskStatus::Todo),
            "In Progress" => Some(TaskStatus::InProgress),
            "Done" => Some(TaskStatus::Done),
            _ => None,
        }
    }

    /// Active tasks count toward a user's smart-assign load.
    pub fn is_active(&self) -> bool {
        !matches!(self, TaskStatus::Done)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskPriority {
    Low,
    Medium,
    High,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "Low",
            TaskPriority::Medium => "Medium",
            TaskPriority::High => "High",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Low" => Some(TaskPriority::Low),
            "Medium" => Some(TaskPriority::Medium),
            "High" => Some(TaskPriority::High),
            _ => None,
        }
    }
}

/// Kind of a logged action. `Assign` and `Move` exist in the wire
/// vocabulary for clients; the daemon itself records the other four.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Create,
    Update,
    Delete,
    Assign,
    Move,
    SmartAssign,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Create => "create",
            ActionKind::Update => "update",
            ActionKind::Delete => "delete",
            ActionKind::Assign => "assign",
            ActionKind::Move => "move",
            ActionKind::SmartAssign => "smart_assign",
        }
    }
}

// ─── API payload types ───────────────────────────────────────────────────────

/// Authenticated actor identity attached to every inbound operation.
/// Resolved by the transport auth handshake before any handler runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: String,
    pub username: String,
    pub email: Option<String>,
}

/// Displayable reference to a user, embedded in task payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub id: String,
    pub username: String,
}

/// A task as clients see it: user references resolved to displayable form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub assigned_to: Option<UserRef>,
    pub created_by: Option<UserRef>,
    pub position: i64,
    pub version: i64,
    pub created_at: String,
    pub updated_at: String,
}

// ─── Validation ──────────────────────────────────────────────────────────────

/// Validate and normalize a task title: trimmed, non-empty, not a
/// reserved column name. Uniqueness is checked separately against storage.
pub fn validate_title(raw: &str) -> Result<String, BoardError> {
    let title = raw.trim();
    if title.is_empty() {
        return Err(BoardError::Validation("title is required".to_string()));
    }
    if RESERVED_TITLES.contains(&title) {
        return Err(BoardError::Validation(
            "task title cannot match a column name".to_string(),
        ));
    }
    Ok(title.to_string())
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_is_trimmed() {
        assert_eq!(validate_title("  Fix login  ").unwrap(), "Fix login");
    }

    #[test]
    fn empty_and_whitespace_titles_rejected() {
        assert!(matches!(validate_title(""), Err(BoardError::Validation(_))));
        assert!(matches!(validate_title("   "), Err(BoardError::Validation(_))));
    }

    #[test]
    fn reserved_titles_rejected_even_with_whitespace() {
        for reserved in RESERVED_TITLES {
            assert!(matches!(
                validate_title(reserved),
                Err(BoardError::Validation(_))
            ));
            assert!(matches!(
                validate_title(&format!("  {reserved} ")),
                Err(BoardError::Validation(_))
            ));
        }
        // Case-sensitive: "todo" is not a column name.
        assert_eq!(validate_title("todo").unwrap(), "todo");
    }

    #[test]
    fn status_wire_form_round_trips() {
        assert_eq!(TaskStatus::InProgress.as_str(), "In Progress");
        assert_eq!(TaskStatus::parse("In Progress"), Some(TaskStatus::InProgress));
        assert_eq!(
            serde_json::to_string(&TaskStatus::InProgress).unwrap(),
            "\"In Progress\""
        );
        assert!(TaskStatus::parse("in progress").is_none());
    }

    #[test]
    fn active_subset_excludes_done() {
        assert!(TaskStatus::Todo.is_active());
        assert!(TaskStatus::InProgress.is_active());
        assert!(!TaskStatus::Done.is_active());
    }
}
