use anyhow::{bail, Result};
use serde_json::{json, Value};

use super::{n, s, sv};
use crate::board::model::{Actor, TaskPriority, TaskStatus};
use crate::board::store::{CreateTask, UpdateTask};
use crate::AppContext;

fn parse_status(params: &Value) -> Result<Option<TaskStatus>> {
    match sv(params, "status") {
        None => Ok(None),
        Some(raw) => match TaskStatus::parse(raw) {
            Some(status) => Ok(Some(status)),
            None => bail!("invalid type: unknown status '{raw}'"),
        },
    }
}

fn parse_priority(params: &Value) -> Result<Option<TaskPriority>> {
    match sv(params, "priority") {
        None => Ok(None),
        Some(raw) => match TaskPriority::parse(raw) {
            Some(priority) => Ok(Some(priority)),
            None => bail!("invalid type: unknown priority '{raw}'"),
        },
    }
}

pub async fn list(_params: Value, _actor: &Actor, ctx: &AppContext) -> Result<Value> {
    let tasks = ctx.tasks.list_tasks().await?;
    Ok(json!({ "tasks": tasks }))
}

pub async fn create(params: Value, actor: &Actor, ctx: &AppContext) -> Result<Value> {
    let title = s(&params, "title").ok_or_else(|| anyhow::anyhow!("missing field: title"))?;
    let input = CreateTask {
        title,
        description: s(&params, "description"),
        priority: parse_priority(&params)?,
        assigned_to: s(&params, "assignedTo"),
    };
    let task = ctx.tasks.create_task(input, actor).await?;
    Ok(json!({ "task": task }))
}

/// Three-way assignee field: absent leaves it untouched, explicit null
/// clears it, a string sets it. Anything else is a type error, not a clear.
fn parse_assignee(params: &Value) -> Result<Option<Option<String>>> {
    match params.get("assignedTo") {
        None => Ok(None),
        Some(Value::Null) => Ok(Some(None)),
        Some(Value::String(id)) => Ok(Some(Some(id.clone()))),
        Some(other) => bail!("invalid type: assignedTo must be a string or null, got {other}"),
    }
}

pub async fn update(params: Value, actor: &Actor, ctx: &AppContext) -> Result<Value> {
    let id = sv(&params, "id").ok_or_else(|| anyhow::anyhow!("missing field: id"))?;
    let patch = UpdateTask {
        title: s(&params, "title"),
        description: s(&params, "description"),
        status: parse_status(&params)?,
        priority: parse_priority(&params)?,
        assigned_to: parse_assignee(&params)?,
        position: n(&params, "position"),
        expected_version: n(&params, "version"),
    };
    let task = ctx.tasks.update_task(id, patch, actor).await?;
    Ok(json!({ "task": task }))
}

pub async fn delete(params: Value, actor: &Actor, ctx: &AppContext) -> Result<Value> {
    let id = sv(&params, "id").ok_or_else(|| anyhow::anyhow!("missing field: id"))?;
    ctx.tasks.delete_task(id, actor).await?;
    Ok(json!({ "deleted": true }))
}

pub async fn smart_assign(params: Value, actor: &Actor, ctx: &AppContext) -> Result<Value> {
    let id = sv(&params, "id").ok_or_else(|| anyhow::anyhow!("missing field: id"))?;
    let task = ctx.tasks.smart_assign(id, actor).await?;
    Ok(json!({ "task": task }))
}
