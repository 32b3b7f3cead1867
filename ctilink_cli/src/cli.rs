use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "ctilink", version, about = "Threat-intelligence connector runtime")]
pub struct Cli {
    /// YAML configuration file; environment variables override its values.
    #[arg(long, global = true, env = "CTILINK_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Consume the connector queue and log every message.
    Listen,

    /// Tail the live stream and log every event.
    Stream {
        /// Stream to follow instead of the configured one.
        #[arg(long)]
        stream_id: Option<String>,

        /// Unix timestamp (ms) to start from when no cursor is stored yet.
        #[arg(long)]
        start_timestamp: Option<String>,
    },

    /// Submit a STIX bundle file to the platform workers.
    Push {
        path: PathBuf,

        #[arg(long)]
        work_id: Option<String>,

        /// Upsert instead of create.
        #[arg(long)]
        update: bool,

        /// Publish the bundle as a single message.
        #[arg(long)]
        bypass_split: bool,

        /// Comma-delimited entity types forwarded to the workers.
        #[arg(long, value_delimiter = ',')]
        entities_types: Vec<String>,
    },

    /// Print the ordered sub-bundles of a STIX bundle file without connecting.
    Split { path: PathBuf },

    /// Print current configuration (redacted secrets).
    Config,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_arguments_parse() {
        let cli = Cli::try_parse_from([
            "ctilink",
            "push",
            "bundle.json",
            "--work-id",
            "work-1",
            "--entities-types",
            "Report,Indicator",
            "--update",
        ])
        .unwrap();
        match cli.command {
            Commands::Push {
                path,
                work_id,
                update,
                bypass_split,
                entities_types,
            } => {
                assert_eq!(path, PathBuf::from("bundle.json"));
                assert_eq!(work_id.as_deref(), Some("work-1"));
                assert!(update);
                assert!(!bypass_split);
                assert_eq!(entities_types, vec!["Report", "Indicator"]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn config_flag_is_global() {
        let cli = Cli::try_parse_from(["ctilink", "split", "b.json", "--config", "c.yml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("c.yml")));
        assert!(matches!(cli.command, Commands::Split { .. }));
    }
}
