use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use std::path::Path as FsPath;
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::error::Error;
use crate::server::{Server, ServerError};
use crate::task::Task;
use crate::tasks::{CreateTask, NodeInfo, Success, TaskAction, TaskId, TaskSummary};


const PARAMETERS_FILE: &str = "body.json";


fn parse_uuid(value: &str) -> Result<String, ServerError> {
    Uuid::parse_str(value)
        .map(|uuid| uuid.to_string())
        .map_err(|_| Error::InvalidTaskId(value.to_string()).into())
}


pub async fn info(State(server): State<Arc<Server>>) -> Json<NodeInfo> {
    let config = &server.manager.context().config;
    Json(NodeInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        task_queue_count: server.manager.get_queue_count().await,
        max_parallel_tasks: config.parallel_queue_processing,
        engine: config.engine_path.display().to_string(),
    })
}


pub async fn list_tasks(State(server): State<Arc<Server>>) -> Json<Vec<TaskId>> {
    let tasks = server
        .manager
        .list()
        .await
        .iter()
        .map(|task| TaskId { uuid: task.id().to_string() })
        .collect();
    Json(tasks)
}


/// Reserves an upload folder and records the task parameters. Images are
/// staged into that folder before the commit.
pub async fn init_task(
    State(server): State<Arc<Server>>,
    headers: HeaderMap,
    Json(params): Json<CreateTask>,
) -> Result<Json<TaskId>, ServerError> {
    let uuid = match headers.get("set-uuid") {
        Some(value) => {
            let value = value
                .to_str()
                .map_err(|_| Error::InvalidTaskId("set-uuid".to_string()))?;
            parse_uuid(value)?
        }
        None => Uuid::new_v4().to_string(),
    };

    let config = &server.manager.context().config;
    if server.manager.find(&uuid).await.is_ok()
        || tokio::fs::try_exists(config.tmp_dir.join(&uuid)).await?
    {
        return Err(Error::InvalidTaskId(format!("{} already exists", uuid)).into());
    }

    let staging = config.tmp_dir.join(&uuid);
    tokio::fs::create_dir_all(&staging).await?;
    let body = serde_json::to_vec(&params).map_err(Error::from)?;
    tokio::fs::write(staging.join(PARAMETERS_FILE), body).await?;

    tracing::info!(task_id = %uuid, "Upload folder created");
    Ok(Json(TaskId { uuid }))
}


/// Moves staged files into a new project folder and admits the task.
pub async fn commit_task(
    State(server): State<Arc<Server>>,
    Path(uuid): Path<String>,
) -> Result<Json<TaskId>, ServerError> {
    let uuid = parse_uuid(&uuid)?;
    let ctx = server.manager.context().clone();
    let staging = ctx.config.tmp_dir.join(&uuid);

    let body = match tokio::fs::read(staging.join(PARAMETERS_FILE)).await {
        Ok(body) => body,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::TaskNotFound(uuid).into());
        }
        Err(err) => return Err(err.into()),
    };
    let params: CreateTask = serde_json::from_slice(&body).map_err(Error::from)?;

    let project = ctx.config.project_path(&uuid);
    move_staged_files(&staging, &project).await?;
    tokio::fs::remove_dir_all(&staging).await?;

    let task = Task::new(uuid.clone(), params, ctx);
    server.manager.add_new(task).await;
    Ok(Json(TaskId { uuid }))
}


async fn move_staged_files(staging: &FsPath, project: &FsPath) -> Result<(), ServerError> {
    let images = project.join("images");
    let gcp = project.join("gcp");
    tokio::fs::create_dir_all(&images).await?;
    tokio::fs::create_dir_all(&gcp).await?;

    let mut entries = tokio::fs::read_dir(staging).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let lower = name.to_string_lossy().to_lowercase();
        if lower == PARAMETERS_FILE || !entry.file_type().await?.is_file() {
            continue;
        }
        let destination = if lower.ends_with(".txt") { &gcp } else { &images };
        tokio::fs::rename(entry.path(), destination.join(&name)).await?;
    }
    Ok(())
}


pub async fn task_info(
    State(server): State<Arc<Server>>,
    Path(uuid): Path<String>,
) -> Result<Json<TaskSummary>, ServerError> {
    let task = server.manager.find(&uuid).await?;
    Ok(Json(task.summary().await))
}


#[derive(Debug, Deserialize)]
pub struct OutputQuery {
    #[serde(default)]
    line: i64,
}

pub async fn task_output(
    State(server): State<Arc<Server>>,
    Path(uuid): Path<String>,
    Query(query): Query<OutputQuery>,
) -> Result<Json<Vec<String>>, ServerError> {
    let task = server.manager.find(&uuid).await?;
    Ok(Json(task.output(query.line).await))
}


pub async fn download_asset(
    State(server): State<Arc<Server>>,
    Path((uuid, asset)): Path<(String, String)>,
) -> Result<impl IntoResponse, ServerError> {
    let task = server.manager.find(&uuid).await?;
    let path = task.asset_path(&asset)?;
    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(ServerError::NotFound(format!("{} is not available", asset)));
        }
        Err(err) => return Err(err.into()),
    };

    let headers = [
        (header::CONTENT_TYPE, "application/zip".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}-{}\"", uuid, asset),
        ),
    ];
    Ok((headers, Body::from_stream(ReaderStream::new(file))))
}


pub async fn cancel_task(
    State(server): State<Arc<Server>>,
    Json(action): Json<TaskAction>,
) -> Result<Json<Success>, ServerError> {
    server.manager.cancel(&action.uuid).await?;
    Ok(Json(Success { success: true }))
}


pub async fn remove_task(
    State(server): State<Arc<Server>>,
    Json(action): Json<TaskAction>,
) -> Result<Json<Success>, ServerError> {
    server.manager.remove(&action.uuid).await?;
    Ok(Json(Success { success: true }))
}


pub async fn restart_task(
    State(server): State<Arc<Server>>,
    Json(action): Json<TaskAction>,
) -> Result<Json<Success>, ServerError> {
    server.manager.restart(&action.uuid, action.options).await?;
    Ok(Json(Success { success: true }))
}
