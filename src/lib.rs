pub mod archive;
pub mod client;
pub mod command;
pub mod config;
pub mod engine;
mod error;
pub mod manager;
pub mod process;
pub mod progress;
mod server;
pub mod task;
pub mod tasks;
pub mod upload;
pub mod webhook;

pub use client::Client;
pub use command::{Cli, Command};
pub use config::{Config, S3Config};
pub use error::{Error, Result};
pub use manager::TaskManager;
pub use progress::{ProgressEvent, ProgressReceiver};
pub use server::{router, serve, Server};
pub use task::{Task, TaskContext};
pub use tasks::{CreateTask, StatusCode, TaskOption, TaskStatus, TaskSummary};
pub use upload::{ObjectStorage, ResultUploader, UploadSettings};
pub use webhook::WebhookNotifier;
