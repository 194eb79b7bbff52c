#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0} not found")]
    TaskNotFound(String),

    #[error("Invalid task id: {0}")]
    InvalidTaskId(String),

    #[error("Task already cancelled")]
    AlreadyCanceled,

    #[error("Task cannot be restarted")]
    CannotRestart,

    #[error("Invalid asset: {0}")]
    InvalidAsset(String),

    #[error("{0}")]
    Process(String),

    #[error("{0}")]
    Upload(String),

    #[error("{0}")]
    Storage(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),

    #[error(transparent)]
    Pattern(#[from] glob::PatternError),

    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
