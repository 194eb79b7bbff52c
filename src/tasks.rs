use serde::{Deserialize, Deserializer, Serialize, Serializer};


#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum StatusCode {
    Queued,
    Running,
    Failed,
    Completed,
    Canceled,
}

impl StatusCode {
    pub fn code(self) -> u8 {
        match self {
            StatusCode::Queued => 10,
            StatusCode::Running => 20,
            StatusCode::Failed => 30,
            StatusCode::Completed => 40,
            StatusCode::Canceled => 50,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            10 => Some(StatusCode::Queued),
            20 => Some(StatusCode::Running),
            30 => Some(StatusCode::Failed),
            40 => Some(StatusCode::Completed),
            50 => Some(StatusCode::Canceled),
            _ => None,
        }
    }

    /// COMPLETED, FAILED and CANCELED can only be left through a restart.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StatusCode::Completed | StatusCode::Failed | StatusCode::Canceled
        )
    }
}

impl Serialize for StatusCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for StatusCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u8::deserialize(deserializer)?;
        StatusCode::from_code(code).ok_or_else(|| {
            serde::de::Error::custom(format!("unknown status code {}", code))
        })
    }
}


#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub code: StatusCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl TaskStatus {
    pub fn new(code: StatusCode) -> Self {
        Self { code, error_message: None }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            code: StatusCode::Failed,
            error_message: Some(message.into()),
        }
    }
}


/// A single `(name, value)` processing option handed to the engine.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TaskOption {
    pub name: String,
    pub value: serde_json::Value,
}

impl TaskOption {
    pub fn new(name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self { name: name.into(), value: value.into() }
    }
}


/// Parameters for a new task, as received from a caller.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CreateTask {
    pub name: Option<String>,
    pub options: Vec<TaskOption>,
    pub webhook: Option<String>,
    pub skip_post_processing: bool,
    pub outputs: Option<Vec<String>>,
    pub date_created: Option<i64>,
    pub images_count_estimate: usize,
}


/// Read-only view of a task, returned to callers and posted to webhooks.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub uuid: String,
    pub name: String,
    pub date_created: i64,
    pub processing_time: i64,
    pub status: TaskStatus,
    pub options: Vec<TaskOption>,
    pub images_count: usize,
    pub progress: f64,
}


/// One entry of the persisted task snapshot.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedTask {
    pub uuid: String,
    pub name: String,
    pub date_created: i64,
    #[serde(default)]
    pub date_started: Option<i64>,
    #[serde(default)]
    pub processing_time: i64,
    pub status: TaskStatus,
    #[serde(default)]
    pub options: Vec<TaskOption>,
    #[serde(default)]
    pub webhook: Option<String>,
    #[serde(default)]
    pub skip_post_processing: bool,
    #[serde(default)]
    pub outputs: Option<Vec<String>>,
}


/// Reference to a task in list and creation replies.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskId {
    pub uuid: String,
}


/// Body of the cancel, remove and restart requests.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskAction {
    pub uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<TaskOption>>,
}


#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Success {
    pub success: bool,
}


#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub version: String,
    pub task_queue_count: usize,
    pub max_parallel_tasks: usize,
    pub engine: String,
}
