use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::client::Client;
use crate::command::{Cli, Command, ServeArgs};
use crate::config::Config;
use crate::error::Error;
use crate::manager::TaskManager;
use crate::progress::ProgressReceiver;
use crate::server::Server;
use crate::task::TaskContext;
use crate::tasks::TaskOption;
use crate::upload::ResultUploader;


pub async fn run() -> Result<(), Error> {
    let args = Cli::parse();

    let default_filter = if args.verbose { "nodeodm=debug" } else { "nodeodm=info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match args.command {
        Command::Serve(serve_args) => serve(serve_args).await,
        Command::List { server } => {
            for task in Client::new(server).list().await? {
                println!("{}", task.uuid);
            }
            Ok(())
        }
        Command::Info { id, server } => {
            let summary = Client::new(server).task_info(&id).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Command::Output { id, line, server } => {
            for line in Client::new(server).output(&id, line).await? {
                println!("{}", line);
            }
            Ok(())
        }
        Command::Cancel { id, server } => Client::new(server).cancel(&id).await,
        Command::Remove { id, server } => Client::new(server).remove(&id).await,
        Command::Restart { id, options, server } => {
            let options: Option<Vec<TaskOption>> = match options {
                Some(json) => Some(serde_json::from_str(&json)?),
                None => None,
            };
            Client::new(server).restart(&id, options).await
        }
    }
}


async fn serve(args: ServeArgs) -> Result<(), Error> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    args.apply(&mut config);
    config.validate()?;

    tokio::fs::create_dir_all(&config.data_dir).await?;
    tokio::fs::create_dir_all(&config.tmp_dir).await?;

    let uploader = ResultUploader::from_config(&config.s3).await?;
    let addr = format!("{}:{}", config.bind, config.port);
    let progress_addr = SocketAddr::from(([0, 0, 0, 0], config.progress_port));

    let manager = TaskManager::new(Arc::new(TaskContext::new(config, uploader)));

    // Restored tasks start during initialization and report right away.
    match ProgressReceiver::bind(progress_addr).await {
        Ok(receiver) => manager.listen_progress(receiver.subscribe()),
        Err(err) => {
            tracing::warn!(addr = %progress_addr, error = %err, "Progress updates disabled");
        }
    }
    manager.initialize().await?;

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "Server listening");

    let server = Arc::new(Server::new(manager.clone()));
    crate::server::serve(server, listener, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "Cannot listen for shutdown signal");
        }
    })
    .await?;

    manager.shutdown().await;
    Ok(())
}
