//! `pixdrop`: resumable chunked uploads from the command line.

mod commands;
mod config;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use pixdrop_protocol::{DestinationOptions, Visibility, WatermarkOptions};
use tracing_subscriber::EnvFilter;

use config::AppConfig;

#[derive(Parser)]
#[command(name = "pixdrop")]
#[command(about = "Resumable chunked uploads", long_about = None, version)]
struct Cli {
    /// Config file (default: ~/.config/pixdrop/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Server base URL, overrides the config file
    #[arg(long, global = true)]
    server: Option<String>,

    /// API token, overrides the config file
    #[arg(long, global = true, env = "PIXDROP_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload files, resuming interrupted uploads of the same content
    Upload {
        /// Files to upload
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Destination folder id
        #[arg(long)]
        folder: Option<String>,

        #[arg(long, value_enum, default_value_t = VisibilityArg::Public)]
        visibility: VisibilityArg,

        /// Watermark text applied by the server
        #[arg(long)]
        watermark: Option<String>,

        /// Chunk requests per wave
        #[arg(long)]
        concurrency: Option<usize>,

        /// Files uploaded at the same time
        #[arg(long)]
        parallel: Option<usize>,
    },
    /// Inspect or prune stored upload sessions
    Sessions {
        #[command(subcommand)]
        action: SessionsCommand,
    },
}

#[derive(Subcommand)]
enum SessionsCommand {
    /// List resumable sessions
    List,
    /// Remove sessions idle for too long
    Clean {
        /// Maximum idle age; defaults to the configured session age
        #[arg(long)]
        max_age_hours: Option<u64>,
    },
    /// Forget one session by id
    Forget { id: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum VisibilityArg {
    Public,
    Unlisted,
    Private,
}

impl From<VisibilityArg> for Visibility {
    fn from(v: VisibilityArg) -> Self {
        match v {
            VisibilityArg::Public => Visibility::Public,
            VisibilityArg::Unlisted => Visibility::Unlisted,
            VisibilityArg::Private => Visibility::Private,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,pixdrop=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = AppConfig::load(cli.config.as_deref())?;
    if let Some(server) = cli.server {
        config.server_url = server;
    }
    if let Some(token) = cli.token {
        config.api_token = token;
    }

    match cli.command {
        Commands::Upload {
            files,
            folder,
            visibility,
            watermark,
            concurrency,
            parallel,
        } => {
            if let Some(n) = concurrency {
                config.engine.concurrency = n;
            }
            if let Some(n) = parallel {
                config.engine.max_concurrent_items = n;
            }
            let destination = DestinationOptions {
                folder_id: folder,
                visibility: visibility.into(),
                ..Default::default()
            };
            let watermark = watermark.map(|text| WatermarkOptions {
                text,
                position: "bottom-right".into(),
                opacity: 0.5,
            });

            let summary = commands::upload(&config, files, destination, watermark).await?;
            tracing::info!(
                completed = summary.completed,
                paused = summary.paused,
                failed = summary.failed,
                "upload run finished"
            );
            if summary.failed > 0 {
                anyhow::bail!("{} upload(s) failed", summary.failed);
            }
        }
        Commands::Sessions { action } => match action {
            SessionsCommand::List => commands::list_sessions(&config)?,
            SessionsCommand::Clean { max_age_hours } => {
                commands::clean_sessions(&config, max_age_hours)?;
            }
            SessionsCommand::Forget { id } => commands::forget_session(&config, &id)?,
        },
    }

    Ok(())
}
