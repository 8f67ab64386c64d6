use anyhow::Result;
use serde_json::{json, Value};

use super::sv;
use crate::AppContext;

pub async fn recent(_params: Value, ctx: &AppContext) -> Result<Value> {
    let actions = ctx.tasks.recent_actions().await?;
    Ok(json!({ "actions": actions }))
}

pub async fn for_task(params: Value, ctx: &AppContext) -> Result<Value> {
    let task_id = sv(&params, "taskId").ok_or_else(|| anyhow::anyhow!("missing field: taskId"))?;
    let actions = ctx.tasks.actions_for_task(task_id).await?;
    Ok(json!({ "actions": actions }))
}

pub async fn for_user(params: Value, ctx: &AppContext) -> Result<Value> {
    let user_id = sv(&params, "userId").ok_or_else(|| anyhow::anyhow!("missing field: userId"))?;
    let actions = ctx.tasks.actions_for_user(user_id).await?;
    Ok(json!({ "actions": actions }))
}
