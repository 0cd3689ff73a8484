//! Hook command - answer the callback plugin during a build
//!
//! Reads one task event as JSON on stdin and prints the response JSON on
//! stdout. The response is always printed; failures turn into a skip so
//! the playbook stops doing work for a broken build.

use crate::build::BuildState;
use crate::cli::args::{HookArgs, HookEvent};
use crate::error::{StratumError, StratumResult};
use crate::interceptor::{HookResponse, StepInterceptor, TaskEvent};
use crate::orchestration::{create_builder, ENV_BUILD_ID, ENV_DB_PATH};
use crate::store::{Database, StateUpdate};
use std::path::Path;
use tokio::io::AsyncReadExt;
use tracing::error;

/// Execute the hook command
pub async fn execute(args: HookArgs, database_dir: Option<&Path>) -> StratumResult<()> {
    let response = match respond(args.event, database_dir).await {
        Ok(response) => response,
        Err(e) => {
            error!("Hook failed: {}", e);
            HookResponse::skip(format!("stratum: {}", e))
        }
    };
    println!("{}", serde_json::to_string(&response)?);
    Ok(())
}

async fn respond(event: HookEvent, database_dir: Option<&Path>) -> StratumResult<HookResponse> {
    let build_id =
        std::env::var(ENV_BUILD_ID).map_err(|_| StratumError::HookEnvMissing(ENV_BUILD_ID))?;
    let dir = database_dir.ok_or(StratumError::HookEnvMissing(ENV_DB_PATH))?;
    let db = Database::new(Some(dir))?;

    match dispatch(event, &db, &build_id).await {
        Ok(response) => Ok(response),
        Err(e) => {
            if let Err(mark) = db
                .update_build(&build_id, StateUpdate::to(BuildState::Failed))
                .await
            {
                error!("Unable to mark build {} as failed: {}", build_id, mark);
            }
            Err(e)
        }
    }
}

async fn dispatch(event: HookEvent, db: &Database, build_id: &str) -> StratumResult<HookResponse> {
    let mut input = String::new();
    tokio::io::stdin()
        .read_to_string(&mut input)
        .await
        .map_err(|e| StratumError::io("reading task event from stdin", e))?;
    let task: TaskEvent = serde_json::from_str(&input)?;

    let build = db.get_build(build_id).await?;
    let builder = create_builder(&build.builder_name)?;
    let hooks = StepInterceptor::new(db, builder.as_ref());

    Ok(match event {
        HookEvent::TaskStart => hooks.task_start(build_id, &task).await,
        HookEvent::TaskResult => hooks.task_result(build_id, &task).await,
    })
}
