use serde::de::DeserializeOwned;

use crate::error::Error;
use crate::tasks::{CreateTask, NodeInfo, Success, TaskAction, TaskId, TaskOption, TaskSummary};


/// HTTP client for a running node.
#[derive(Clone, Debug)]
pub struct Client {
    reqwest: reqwest::Client,
    server: String,
}

impl Client {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            reqwest: reqwest::Client::new(),
            server: server.into().trim_end_matches('/').to_string(),
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, Error> {
        let response = self.reqwest
            .get(format!("{}{}", self.server, path))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn action(&self, path: &str, action: &TaskAction) -> Result<(), Error> {
        let response = self.reqwest
            .post(format!("{}{}", self.server, path))
            .json(action)
            .send()
            .await?
            .error_for_status()?;
        let _: Success = response.json().await?;
        Ok(())
    }

    pub async fn info(&self) -> Result<NodeInfo, Error> {
        self.get("/info").await
    }

    pub async fn list(&self) -> Result<Vec<TaskId>, Error> {
        self.get("/task/list").await
    }

    /// Reserves an upload folder, optionally under a caller-chosen id.
    pub async fn init(&self, params: &CreateTask, uuid: Option<&str>) -> Result<TaskId, Error> {
        let mut request = self.reqwest
            .post(format!("{}/task/new/init", self.server))
            .json(params);
        if let Some(uuid) = uuid {
            request = request.header("set-uuid", uuid);
        }
        let response = request.send().await?.error_for_status()?;
        Ok(response.json().await?)
    }

    pub async fn commit(&self, uuid: &str) -> Result<TaskId, Error> {
        let response = self.reqwest
            .post(format!("{}/task/new/commit/{}", self.server, uuid))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    pub async fn task_info(&self, uuid: &str) -> Result<TaskSummary, Error> {
        self.get(&format!("/task/{}/info", uuid)).await
    }

    pub async fn output(&self, uuid: &str, line: i64) -> Result<Vec<String>, Error> {
        self.get(&format!("/task/{}/output?line={}", uuid, line)).await
    }

    pub async fn cancel(&self, uuid: &str) -> Result<(), Error> {
        let action = TaskAction { uuid: uuid.to_string(), options: None };
        self.action("/task/cancel", &action).await
    }

    pub async fn remove(&self, uuid: &str) -> Result<(), Error> {
        let action = TaskAction { uuid: uuid.to_string(), options: None };
        self.action("/task/remove", &action).await
    }

    pub async fn restart(&self, uuid: &str, options: Option<Vec<TaskOption>>) -> Result<(), Error> {
        let action = TaskAction { uuid: uuid.to_string(), options };
        self.action("/task/restart", &action).await
    }
}
