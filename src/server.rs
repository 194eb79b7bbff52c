use axum::routing::{get, post};
use axum::Json;
use std::future::Future;
use std::sync::Arc;

use crate::error::Error;
use crate::manager::TaskManager;

mod handlers;


pub struct Server {
    pub manager: TaskManager,
}

impl Server {
    pub fn new(manager: TaskManager) -> Self {
        Self { manager }
    }
}


pub enum ServerError {
    NotFound(String),
    BadRequest(String),
    InternalServerError(String),
}

impl From<Error> for ServerError {
    fn from(err: Error) -> Self {
        match err {
            Error::TaskNotFound(_) => ServerError::NotFound(err.to_string()),
            Error::InvalidTaskId(_)
            | Error::AlreadyCanceled
            | Error::CannotRestart
            | Error::InvalidAsset(_)
            | Error::Json(_) => ServerError::BadRequest(err.to_string()),
            err => ServerError::InternalServerError(err.to_string()),
        }
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        Error::from(err).into()
    }
}

impl axum::response::IntoResponse for ServerError {
    fn into_response(self) -> axum::http::Response<axum::body::Body> {
        let (status, message) = match self {
            ServerError::NotFound(message) => (axum::http::StatusCode::NOT_FOUND, message),
            ServerError::BadRequest(message) => (axum::http::StatusCode::BAD_REQUEST, message),
            ServerError::InternalServerError(message) => {
                tracing::error!(error = %message, "Request failed");
                (axum::http::StatusCode::INTERNAL_SERVER_ERROR, message)
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}


pub fn router(server: Arc<Server>) -> axum::Router {
    axum::Router::new()
        .route("/info", get(handlers::info))
        .route("/task/list", get(handlers::list_tasks))
        .route("/task/new/init", post(handlers::init_task))
        .route("/task/new/commit/:uuid", post(handlers::commit_task))
        .route("/task/cancel", post(handlers::cancel_task))
        .route("/task/remove", post(handlers::remove_task))
        .route("/task/restart", post(handlers::restart_task))
        .route("/task/:uuid/info", get(handlers::task_info))
        .route("/task/:uuid/output", get(handlers::task_output))
        .route("/task/:uuid/download/:asset", get(handlers::download_asset))
        .with_state(server)
}


pub async fn serve(
    server: Arc<Server>,
    listener: tokio::net::TcpListener,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    let app = router(server);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}
