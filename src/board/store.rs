//! Task store: validated, optimistic-concurrency-controlled mutation of
//! shared task state.
//!
//! Every successful mutation appends exactly one action log entry (except
//! an update that changed nothing, which appends none) and emits one
//! broadcast event. Every failed mutation leaves stored state untouched.

use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::board::assign;
use crate::board::error::{BoardError, BoardResult};
use crate::board::model::{
    new_id, now_rfc3339, validate_title, ActionKind, Actor, Task, TaskPriority, TaskStatus,
    UserRef,
};
use crate::ipc::event::EventBroadcaster;
use crate::storage::{is_unique_violation, ActionRow, Storage, TaskRow};

/// Cap for the global and per-user action feeds. Per-task history is
/// unbounded.
const ACTION_FEED_LIMIT: i64 = 20;

pub struct CreateTask {
    pub title: String,
    pub description: Option<String>,
    pub priority: Option<TaskPriority>,
    pub assigned_to: Option<String>,
}

/// Partial update. `None` fields are left untouched; for the assignee,
/// `Some(None)` explicitly clears it.
#[derive(Default)]
pub struct UpdateTask {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<TaskStatus>,
    pub priority: Option<TaskPriority>,
    pub assigned_to: Option<Option<String>>,
    pub position: Option<i64>,
    /// Optimistic-concurrency guard: when present, the mutation is rejected
    /// unless it matches the stored version.
    pub expected_version: Option<i64>,
}

pub struct TaskService {
    storage: Arc<Storage>,
    broadcaster: EventBroadcaster,
}

impl TaskService {
    pub fn new(storage: Arc<Storage>, broadcaster: EventBroadcaster) -> Self {
        Self {
            storage,
            broadcaster,
        }
    }

    // ─── Mutations ───────────────────────────────────────────────────────────

    pub async fn create_task(&self, input: CreateTask, actor: &Actor) -> BoardResult<Task> {
        let title = validate_title(&input.title)?;
        if self.storage.find_by_title(&title, None).await?.is_some() {
            return Err(BoardError::Validation(
                "task title must be unique".to_string(),
            ));
        }

        let now = now_rfc3339();
        let row = TaskRow {
            id: new_id(),
            title,
            description: input
                .description
                .as_deref()
                .unwrap_or_default()
                .trim()
                .to_string(),
            status: TaskStatus::Todo.as_str().to_string(),
            priority: input
                .priority
                .unwrap_or(TaskPriority::Medium)
                .as_str()
                .to_string(),
            assigned_to: input.assigned_to,
            created_by: actor.id.clone(),
            position: 0,
            version: 1,
            created_at: now.clone(),
            updated_at: now,
        };

        // The UNIQUE index closes the race two concurrent creates with the
        // same title would otherwise win together.
        if let Err(e) = self.storage.insert_task(&row).await {
            if is_unique_violation(&e) {
                return Err(BoardError::Validation(
                    "task title must be unique".to_string(),
                ));
            }
            return Err(e.into());
        }

        self.storage
            .record_action(
                ActionKind::Create.as_str(),
                &row.id,
                &actor.id,
                &json!({ "title": row.title, "status": row.status }),
            )
            .await?;

        let task = self.resolve(&row).await?;
        self.broadcaster
            .broadcast("taskCreated", serde_json::to_value(&task).unwrap_or_default());
        Ok(task)
    }

    pub async fn update_task(
        &self,
        id: &str,
        patch: UpdateTask,
        actor: &Actor,
    ) -> BoardResult<Task> {
        let old = self
            .storage
            .get_task(id)
            .await?
            .ok_or(BoardError::NotFound)?;

        if let Some(expected) = patch.expected_version {
            if expected != old.version {
                return Err(self.conflict(&old).await?);
            }
        }

        let mut new_row = old.clone();
        if let Some(raw) = &patch.title {
            let title = validate_title(raw)?;
            if title != old.title
                && self
                    .storage
                    .find_by_title(&title, Some(&old.id))
                    .await?
                    .is_some()
            {
                return Err(BoardError::Validation(
                    "task title must be unique".to_string(),
                ));
            }
            new_row.title = title;
        }
        if let Some(description) = &patch.description {
            new_row.description = description.trim().to_string();
        }
        if let Some(status) = patch.status {
            new_row.status = status.as_str().to_string();
        }
        if let Some(priority) = patch.priority {
            new_row.priority = priority.as_str().to_string();
        }
        if let Some(assigned_to) = patch.assigned_to {
            new_row.assigned_to = assigned_to;
        }
        if let Some(position) = patch.position {
            new_row.position = position;
        }

        if new_row == old {
            // Nothing changed: no version bump, no action, no event.
            return self.resolve(&old).await;
        }

        let changes = field_changes(&old, &new_row);
        new_row.updated_at = now_rfc3339();

        let applied = match self.storage.update_task_if_version(&new_row, old.version).await {
            Ok(applied) => applied,
            Err(e) if is_unique_violation(&e) => {
                return Err(BoardError::Validation(
                    "task title must be unique".to_string(),
                ));
            }
            Err(e) => return Err(e.into()),
        };
        if !applied {
            // Lost a race after our read — the stored version moved on.
            let current = self
                .storage
                .get_task(id)
                .await?
                .ok_or(BoardError::NotFound)?;
            return Err(self.conflict(&current).await?);
        }
        new_row.version = old.version + 1;

        // Position-only moves persist but are not action-logged; the log
        // tracks the five content fields.
        if !changes.is_empty() {
            self.storage
                .record_action(
                    ActionKind::Update.as_str(),
                    &new_row.id,
                    &actor.id,
                    &json!({ "changes": changes }),
                )
                .await?;
        }

        let task = self.resolve(&new_row).await?;
        self.broadcaster
            .broadcast("taskUpdated", serde_json::to_value(&task).unwrap_or_default());
        Ok(task)
    }

    pub async fn delete_task(&self, id: &str, actor: &Actor) -> BoardResult<()> {
        let old = self
            .storage
            .get_task(id)
            .await?
            .ok_or(BoardError::NotFound)?;

        if !self.storage.delete_task(id).await? {
            return Err(BoardError::NotFound);
        }

        self.storage
            .record_action(
                ActionKind::Delete.as_str(),
                id,
                &actor.id,
                &json!({ "title": old.title, "status": old.status }),
            )
            .await?;

        self.broadcaster.broadcast(
            "taskDeleted",
            json!({ "id": id, "title": old.title, "status": old.status }),
        );
        Ok(())
    }

    /// Assign the task to the least-loaded known user. Unconditional
    /// targeted write — no `expected_version` check on this path.
    pub async fn smart_assign(&self, id: &str, actor: &Actor) -> BoardResult<Task> {
        let task = self
            .storage
            .get_task(id)
            .await?
            .ok_or(BoardError::NotFound)?;

        let users = self.storage.list_users().await?;
        let counts = self.storage.active_assignment_counts().await?;
        let (selected, active_count) =
            assign::least_loaded(&users, &counts).ok_or(BoardError::NoEligibleUser)?;

        let previous = task.assigned_to.clone();
        if !self.storage.reassign_task(id, Some(&selected.id)).await? {
            return Err(BoardError::NotFound);
        }

        self.storage
            .record_action(
                ActionKind::SmartAssign.as_str(),
                id,
                &actor.id,
                &json!({
                    "assignedTo": selected.username,
                    "previousAssignee": previous,
                    "taskCount": active_count,
                }),
            )
            .await?;

        let row = self
            .storage
            .get_task(id)
            .await?
            .ok_or(BoardError::NotFound)?;
        let resolved = self.resolve(&row).await?;
        self.broadcaster.broadcast(
            "taskUpdated",
            serde_json::to_value(&resolved).unwrap_or_default(),
        );
        Ok(resolved)
    }

    // ─── Queries ─────────────────────────────────────────────────────────────

    pub async fn list_tasks(&self) -> BoardResult<Vec<Task>> {
        let rows = self.storage.list_tasks().await?;
        let mut tasks = Vec::with_capacity(rows.len());
        for row in &rows {
            tasks.push(self.resolve(row).await?);
        }
        Ok(tasks)
    }

    pub async fn get_task(&self, id: &str) -> BoardResult<Task> {
        let row = self
            .storage
            .get_task(id)
            .await?
            .ok_or(BoardError::NotFound)?;
        self.resolve(&row).await
    }

    pub async fn recent_actions(&self) -> BoardResult<Vec<ActionRow>> {
        Ok(self.storage.recent_actions(ACTION_FEED_LIMIT).await?)
    }

    pub async fn actions_for_task(&self, task_id: &str) -> BoardResult<Vec<ActionRow>> {
        Ok(self.storage.actions_for_task(task_id).await?)
    }

    pub async fn actions_for_user(&self, user_id: &str) -> BoardResult<Vec<ActionRow>> {
        Ok(self
            .storage
            .actions_for_user(user_id, ACTION_FEED_LIMIT)
            .await?)
    }

    // ─── Internal ────────────────────────────────────────────────────────────

    /// Resolve a storage row into the client-facing task payload, with
    /// user references expanded to displayable form.
    async fn resolve(&self, row: &TaskRow) -> BoardResult<Task> {
        let status = TaskStatus::parse(&row.status)
            .ok_or_else(|| anyhow::anyhow!("unknown task status in storage: {:?}", row.status))?;
        let priority = TaskPriority::parse(&row.priority).ok_or_else(|| {
            anyhow::anyhow!("unknown task priority in storage: {:?}", row.priority)
        })?;
        let assigned_to = match &row.assigned_to {
            Some(id) => self.user_ref(id).await?,
            None => None,
        };
        let created_by = self.user_ref(&row.created_by).await?;
        Ok(Task {
            id: row.id.clone(),
            title: row.title.clone(),
            description: row.description.clone(),
            status,
            priority,
            assigned_to,
            created_by,
            position: row.position,
            version: row.version,
            created_at: row.created_at.clone(),
            updated_at: row.updated_at.clone(),
        })
    }

    async fn user_ref(&self, id: &str) -> BoardResult<Option<UserRef>> {
        Ok(self.storage.get_user(id).await?.map(|u| UserRef {
            id: u.id,
            username: u.username,
        }))
    }

    async fn conflict(&self, current: &TaskRow) -> BoardResult<BoardError> {
        Ok(BoardError::Conflict {
            current: Box::new(self.resolve(current).await?),
        })
    }
}

/// Field-level diff of the action-logged fields, shaped
/// `{field: {"from": …, "to": …}}` with only changed fields present.
fn field_changes(old: &TaskRow, new: &TaskRow) -> Map<String, Value> {
    let mut changes = Map::new();
    let mut track = |field: &str, from: Value, to: Value| {
        if from != to {
            changes.insert(field.to_string(), json!({ "from": from, "to": to }));
        }
    };
    track("title", json!(old.title), json!(new.title));
    track("description", json!(old.description), json!(new.description));
    track("status", json!(old.status), json!(new.status));
    track("priority", json!(old.priority), json!(new.priority));
    track("assignedTo", json!(old.assigned_to), json!(new.assigned_to));
    changes
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn service_with_users(users: &[(&str, &str)]) -> TaskService {
        let storage = Arc::new(Storage::in_memory().await.unwrap());
        for (id, name) in users {
            storage.upsert_user(id, name, "").await.unwrap();
        }
        TaskService::new(storage, EventBroadcaster::new())
    }

    fn actor(id: &str) -> Actor {
        Actor {
            id: id.to_string(),
            username: format!("{id}-name"),
            email: None,
        }
    }

    fn create_input(title: &str) -> CreateTask {
        CreateTask {
            title: title.to_string(),
            description: Some("  desc  ".to_string()),
            priority: None,
            assigned_to: None,
        }
    }

    #[tokio::test]
    async fn create_then_read_round_trips() {
        let svc = service_with_users(&[("u1", "alice")]).await;
        let created = svc
            .create_task(create_input("  Ship it  "), &actor("u1"))
            .await
            .unwrap();
        assert_eq!(created.title, "Ship it");
        assert_eq!(created.description, "desc");
        assert_eq!(created.status, TaskStatus::Todo);
        assert_eq!(created.priority, TaskPriority::Medium);
        assert_eq!(created.version, 1);
        assert_eq!(created.created_by.as_ref().unwrap().username, "alice");

        let read = svc.get_task(&created.id).await.unwrap();
        assert_eq!(read.title, created.title);
        assert_eq!(read.version, 1);

        // Exactly one action.
        let actions = svc.actions_for_task(&created.id).await.unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind, "create");
    }

    #[tokio::test]
    async fn duplicate_and_reserved_titles_rejected() {
        let svc = service_with_users(&[("u1", "alice")]).await;
        svc.create_task(create_input("Unique"), &actor("u1"))
            .await
            .unwrap();

        let dup = svc
            .create_task(create_input("Unique"), &actor("u1"))
            .await
            .unwrap_err();
        assert!(matches!(dup, BoardError::Validation(_)));

        let reserved = svc
            .create_task(create_input("  Todo "), &actor("u1"))
            .await
            .unwrap_err();
        assert!(matches!(reserved, BoardError::Validation(_)));
    }

    #[tokio::test]
    async fn stale_version_conflicts_and_leaves_state_unchanged() {
        let svc = service_with_users(&[("u1", "alice")]).await;
        let task = svc
            .create_task(create_input("Guarded"), &actor("u1"))
            .await
            .unwrap();

        // Bump to version 2.
        svc.update_task(
            &task.id,
            UpdateTask {
                status: Some(TaskStatus::InProgress),
                expected_version: Some(1),
                ..Default::default()
            },
            &actor("u1"),
        )
        .await
        .unwrap();

        // Writer still on version 1 must get the authoritative task back.
        let err = svc
            .update_task(
                &task.id,
                UpdateTask {
                    status: Some(TaskStatus::Done),
                    expected_version: Some(1),
                    ..Default::default()
                },
                &actor("u1"),
            )
            .await
            .unwrap_err();
        match err {
            BoardError::Conflict { current } => {
                assert_eq!(current.version, 2);
                assert_eq!(current.status, TaskStatus::InProgress);
            }
            other => panic!("expected conflict, got {other:?}"),
        }

        let stored = svc.get_task(&task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::InProgress);
        assert_eq!(stored.version, 2);
    }

    #[tokio::test]
    async fn update_logs_only_changed_fields_and_noop_logs_nothing() {
        let svc = service_with_users(&[("u1", "alice")]).await;
        let task = svc
            .create_task(create_input("Diffed"), &actor("u1"))
            .await
            .unwrap();

        let updated = svc
            .update_task(
                &task.id,
                UpdateTask {
                    status: Some(TaskStatus::InProgress),
                    priority: Some(TaskPriority::High),
                    ..Default::default()
                },
                &actor("u1"),
            )
            .await
            .unwrap();
        assert_eq!(updated.version, 2);

        let actions = svc.actions_for_task(&task.id).await.unwrap();
        assert_eq!(actions.len(), 2); // create + update
        let details: Value = serde_json::from_str(&actions[0].details).unwrap();
        let changes = details["changes"].as_object().unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes["status"]["from"], "Todo");
        assert_eq!(changes["status"]["to"], "In Progress");
        assert_eq!(changes["priority"]["to"], "High");

        // Re-submitting the same values changes nothing.
        let same = svc
            .update_task(
                &task.id,
                UpdateTask {
                    status: Some(TaskStatus::InProgress),
                    ..Default::default()
                },
                &actor("u1"),
            )
            .await
            .unwrap();
        assert_eq!(same.version, 2);
        assert_eq!(svc.actions_for_task(&task.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn title_change_revalidates_against_other_tasks_only() {
        let svc = service_with_users(&[("u1", "alice")]).await;
        let a = svc
            .create_task(create_input("First"), &actor("u1"))
            .await
            .unwrap();
        svc.create_task(create_input("Second"), &actor("u1"))
            .await
            .unwrap();

        // Keeping its own title is fine.
        svc.update_task(
            &a.id,
            UpdateTask {
                title: Some("First".to_string()),
                description: Some("now with details".to_string()),
                ..Default::default()
            },
            &actor("u1"),
        )
        .await
        .unwrap();

        // Taking another live task's title is not.
        let err = svc
            .update_task(
                &a.id,
                UpdateTask {
                    title: Some(" Second ".to_string()),
                    ..Default::default()
                },
                &actor("u1"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BoardError::Validation(_)));
    }

    #[tokio::test]
    async fn delete_removes_task_and_logs_last_known_state() {
        let svc = service_with_users(&[("u1", "alice")]).await;
        let task = svc
            .create_task(create_input("Doomed"), &actor("u1"))
            .await
            .unwrap();

        svc.delete_task(&task.id, &actor("u1")).await.unwrap();
        assert!(matches!(
            svc.get_task(&task.id).await.unwrap_err(),
            BoardError::NotFound
        ));
        assert!(matches!(
            svc.delete_task(&task.id, &actor("u1")).await.unwrap_err(),
            BoardError::NotFound
        ));

        // History survives the hard delete.
        let actions = svc.actions_for_task(&task.id).await.unwrap();
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].kind, "delete");
        let details: Value = serde_json::from_str(&actions[0].details).unwrap();
        assert_eq!(details["title"], "Doomed");
        assert_eq!(details["status"], "Todo");
    }

    #[tokio::test]
    async fn smart_assign_picks_least_loaded_and_records_counts() {
        let svc = service_with_users(&[("u1", "alice"), ("u2", "bob")]).await;

        // Two active tasks on bob.
        for title in ["Busy 1", "Busy 2"] {
            let t = svc
                .create_task(
                    CreateTask {
                        title: title.to_string(),
                        description: None,
                        priority: None,
                        assigned_to: Some("u2".to_string()),
                    },
                    &actor("u1"),
                )
                .await
                .unwrap();
            assert_eq!(t.assigned_to.as_ref().unwrap().id, "u2");
        }

        let target = svc
            .create_task(create_input("Needs an owner"), &actor("u2"))
            .await
            .unwrap();
        let assigned = svc.smart_assign(&target.id, &actor("u2")).await.unwrap();
        assert_eq!(assigned.assigned_to.as_ref().unwrap().id, "u1");
        assert_eq!(assigned.version, 2);

        let actions = svc.actions_for_task(&target.id).await.unwrap();
        assert_eq!(actions[0].kind, "smart_assign");
        let details: Value = serde_json::from_str(&actions[0].details).unwrap();
        assert_eq!(details["assignedTo"], "alice");
        assert_eq!(details["previousAssignee"], Value::Null);
        assert_eq!(details["taskCount"], 0);
    }

    #[tokio::test]
    async fn smart_assign_without_users_fails() {
        let svc = service_with_users(&[]).await;
        // Task created by an actor who never registered as a user.
        let task = svc
            .create_task(create_input("Orphan"), &actor("ghost"))
            .await
            .unwrap();
        let err = svc.smart_assign(&task.id, &actor("ghost")).await.unwrap_err();
        assert!(matches!(err, BoardError::NoEligibleUser));
    }

    #[tokio::test]
    async fn smart_assign_bypasses_version_check() {
        let svc = service_with_users(&[("u1", "alice")]).await;
        let task = svc
            .create_task(create_input("Contended"), &actor("u1"))
            .await
            .unwrap();
        // Another writer bumps the version first.
        svc.update_task(
            &task.id,
            UpdateTask {
                status: Some(TaskStatus::InProgress),
                expected_version: Some(1),
                ..Default::default()
            },
            &actor("u1"),
        )
        .await
        .unwrap();

        // Smart-assign succeeds regardless of the moved version.
        let assigned = svc.smart_assign(&task.id, &actor("u1")).await.unwrap();
        assert_eq!(assigned.assigned_to.as_ref().unwrap().id, "u1");
        assert_eq!(assigned.version, 3);
    }

    #[tokio::test]
    async fn list_orders_by_position_then_newest() {
        let svc = service_with_users(&[("u1", "alice")]).await;
        let a = svc
            .create_task(create_input("Older"), &actor("u1"))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let b = svc
            .create_task(create_input("Newer"), &actor("u1"))
            .await
            .unwrap();
        // Push the older task to a later position band.
        svc.update_task(
            &a.id,
            UpdateTask {
                position: Some(5),
                ..Default::default()
            },
            &actor("u1"),
        )
        .await
        .unwrap();

        let listed = svc.list_tasks().await.unwrap();
        assert_eq!(listed[0].id, b.id);
        assert_eq!(listed[1].id, a.id);
    }
}
