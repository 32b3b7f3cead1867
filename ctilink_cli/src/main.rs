mod cli;

use clap::Parser;
use cli::{Cli, Commands};
use ctilink_core::{
    ConnectorConfig, ConnectorRuntime, StreamOptions, SubmitOptions, message_callback,
    split_bundle_json, stream_callback,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Split { path } => {
            ctilink_core::o11y::init_tracing("info", false)?;
            let raw = tokio::fs::read_to_string(&path).await?;
            let parts = split_bundle_json(&raw)?;
            tracing::info!(parts = parts.len(), path = %path.display(), "bundle split");
            for part in &parts {
                println!("{}", part.to_json()?);
            }
        }
        Commands::Config => {
            let config = ConnectorConfig::load(cli.config.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&config.redacted())?);
        }
        command => run_connector(cli.config, command).await?,
    }
    Ok(())
}

async fn run_connector(
    config_path: Option<std::path::PathBuf>,
    command: Commands,
) -> anyhow::Result<()> {
    let config = ConnectorConfig::load(config_path.as_deref())?;
    ctilink_core::o11y::init_tracing(&config.connector.log_level, config.opencti.json_logging)?;
    tracing::info!(config = %config.redacted(), "configuration loaded");

    let collaborators = ctilink_integrations::collaborators(&config.opencti)?;
    let runtime = ConnectorRuntime::register(config, collaborators).await?;

    match command {
        Commands::Listen => {
            runtime
                .listen(message_callback(|event| async move {
                    tracing::info!(%event, "message received");
                    Ok("Message logged".to_string())
                }))
                .await?;
            runtime.supervise(shutdown_signal()).await?;
        }
        Commands::Stream {
            stream_id,
            start_timestamp,
        } => {
            let options = StreamOptions {
                live_stream_id: stream_id,
                start_timestamp,
                ..Default::default()
            };
            runtime
                .listen_stream(
                    stream_callback(|event| async move {
                        tracing::info!(
                            id = event.id.as_deref().unwrap_or(""),
                            event = %event.event,
                            data = %event.data,
                            "stream event"
                        );
                        Ok(())
                    }),
                    options,
                )
                .await?;
            runtime.supervise(shutdown_signal()).await?;
        }
        Commands::Push {
            path,
            work_id,
            update,
            bypass_split,
            entities_types,
        } => {
            let submitted = match tokio::fs::read_to_string(&path).await {
                Ok(raw) => {
                    let options = SubmitOptions {
                        work_id,
                        entities_types,
                        update,
                        bypass_split,
                        ..Default::default()
                    };
                    runtime.submit_json(&raw, options).await.map_err(anyhow::Error::from)
                }
                Err(e) => Err(e.into()),
            };
            runtime.stop().await?;
            let parts = submitted?;
            tracing::info!(parts = parts.len(), path = %path.display(), "bundle submitted");
        }
        Commands::Split { .. } | Commands::Config => {}
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(%e, "unable to listen for the shutdown signal");
    }
}
