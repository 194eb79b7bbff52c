use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::Config;

mod run;

pub use run::run;


const DEFAULT_SERVER: &str = "http://localhost:3000";


#[derive(Debug, Parser)]
#[command(name = "nodeodm", version, about = "Photogrammetry processing node")]
pub struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}


#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the processing node
    Serve(ServeArgs),
    /// List task ids
    List {
        #[arg(long, env = "NODEODM_SERVER", default_value = DEFAULT_SERVER)]
        server: String,
    },
    /// Show a task summary
    Info {
        id: String,
        #[arg(long, env = "NODEODM_SERVER", default_value = DEFAULT_SERVER)]
        server: String,
    },
    /// Print a task's output log
    Output {
        id: String,
        /// First line to print; negative values print the last lines
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        line: i64,
        #[arg(long, env = "NODEODM_SERVER", default_value = DEFAULT_SERVER)]
        server: String,
    },
    /// Cancel a task
    Cancel {
        id: String,
        #[arg(long, env = "NODEODM_SERVER", default_value = DEFAULT_SERVER)]
        server: String,
    },
    /// Cancel a task and delete its data
    Remove {
        id: String,
        #[arg(long, env = "NODEODM_SERVER", default_value = DEFAULT_SERVER)]
        server: String,
    },
    /// Queue a finished task again
    Restart {
        id: String,
        /// Replacement options as a JSON list of {"name", "value"}
        #[arg(long)]
        options: Option<String>,
        #[arg(long, env = "NODEODM_SERVER", default_value = DEFAULT_SERVER)]
        server: String,
    },
}


#[derive(Debug, Args)]
pub struct ServeArgs {
    /// YAML configuration file
    #[arg(short, long, env = "NODEODM_CONFIG")]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub bind: Option<String>,
    #[arg(short, long)]
    pub port: Option<u16>,
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
    #[arg(long)]
    pub tmp_dir: Option<PathBuf>,
    #[arg(long)]
    pub engine_path: Option<PathBuf>,
    #[arg(long)]
    pub parallel_queue_processing: Option<usize>,
    /// Minutes
    #[arg(long)]
    pub max_runtime: Option<u64>,
    #[arg(long)]
    pub webhook: Option<String>,
    #[arg(long)]
    pub progress_port: Option<u16>,
    #[arg(long, env = "S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,
    #[arg(long, env = "S3_BUCKET")]
    pub s3_bucket: Option<String>,
    #[arg(long, env = "AWS_ACCESS_KEY_ID", hide_env_values = true)]
    pub s3_access_key: Option<String>,
    #[arg(long, env = "AWS_SECRET_ACCESS_KEY", hide_env_values = true)]
    pub s3_secret_key: Option<String>,
}

impl ServeArgs {
    /// Command-line values win over the configuration file.
    pub fn apply(&self, config: &mut Config) {
        if let Some(bind) = &self.bind {
            config.bind = bind.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(data_dir) = &self.data_dir {
            config.data_dir = data_dir.clone();
        }
        if let Some(tmp_dir) = &self.tmp_dir {
            config.tmp_dir = tmp_dir.clone();
        }
        if let Some(engine_path) = &self.engine_path {
            config.engine_path = engine_path.clone();
        }
        if let Some(parallel) = self.parallel_queue_processing {
            config.parallel_queue_processing = parallel;
        }
        if self.max_runtime.is_some() {
            config.max_runtime = self.max_runtime;
        }
        if self.webhook.is_some() {
            config.webhook = self.webhook.clone();
        }
        if let Some(progress_port) = self.progress_port {
            config.progress_port = progress_port;
        }
        if self.s3_endpoint.is_some() {
            config.s3.endpoint = self.s3_endpoint.clone();
        }
        if self.s3_bucket.is_some() {
            config.s3.bucket = self.s3_bucket.clone();
        }
        if self.s3_access_key.is_some() {
            config.s3.access_key = self.s3_access_key.clone();
        }
        if self.s3_secret_key.is_some() {
            config.s3.secret_key = self.s3_secret_key.clone();
        }
    }
}
