//! Mediadock CLI - drive the media library backends from a shell
//!
//! Usage:
//!   mediadock-cli providers                          List configured providers
//!   mediadock-cli list <provider> [path]             List a folder (or album)
//!   mediadock-cli upload <provider> <file> [path]    Upload a local file
//!   mediadock-cli rename <provider> <url> <name>     Rename a stored file
//!   mediadock-cli delete <provider> <url>            Delete a stored file
//!   mediadock-cli albums <provider>                  List albums (Lsky Pro)
//!   mediadock-cli test <provider>                    Test credentials
//!
//! Results are printed to stdout as JSON; logs go to stderr.

use anyhow::Context;
use clap::{Parser, Subcommand};
use mediadock::operations::{dispatch, Operation};
use mediadock::settings::{load_settings_from, settings_path};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "mediadock-cli",
    about = "Mediadock CLI - media library backends",
    version,
    long_about = "Browse, upload, rename and delete media on local disk, Tencent COS, Aliyun OSS, UpYun and Lsky Pro.\nProvider credentials are read from the settings file."
)]
struct Cli {
    /// Settings file (default: <config dir>/mediadock/settings.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Pretty-print JSON results
    #[arg(long, global = true)]
    pretty: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List providers with complete credentials
    Providers,
    /// List folders and files
    List {
        /// Provider key (local, cos, oss, upyun, lsky)
        provider: String,
        /// Folder path (default: root)
        #[arg(default_value = "")]
        path: String,
        /// Album id (Lsky Pro only)
        #[arg(long)]
        album: Option<String>,
    },
    /// Upload a file, compressing images first
    Upload {
        provider: String,
        /// Local file
        file: PathBuf,
        /// Target folder
        #[arg(default_value = "")]
        path: String,
        /// Stored name (default: the local file name)
        #[arg(long)]
        name: Option<String>,
    },
    /// Rename a stored file, keeping its folder and extension
    Rename {
        provider: String,
        /// Public URL of the file
        url: String,
        /// New base name
        new_name: String,
        /// Provider key, when the URL cannot be mapped back
        #[arg(long)]
        key: Option<String>,
    },
    /// Delete a stored file
    Delete {
        provider: String,
        /// Public URL of the file (may be empty when --key is given)
        #[arg(default_value = "")]
        url: String,
        #[arg(long)]
        key: Option<String>,
    },
    /// List albums
    Albums { provider: String },
    /// Test provider credentials
    Test { provider: String },
}

impl Commands {
    fn into_operation(self) -> anyhow::Result<Operation> {
        Ok(match self {
            Commands::Providers => Operation::Providers,
            Commands::List { provider, path, album } => Operation::List { provider, path, album },
            Commands::Upload { provider, file, path, name } => {
                let name = match name {
                    Some(name) => name,
                    None => file
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .with_context(|| format!("{} has no file name", file.display()))?,
                };
                Operation::Upload { provider, file, name, path, remove_source: false }
            }
            Commands::Rename { provider, url, new_name, key } => Operation::Rename { provider, url, key, new_name },
            Commands::Delete { provider, url, key } => Operation::Delete { provider, url, key },
            Commands::Albums { provider } => Operation::Albums { provider },
            Commands::Test { provider } => Operation::Test { provider },
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("mediadock=info")),
        )
        .init();

    let cli = Cli::parse();
    let path = cli.config.clone().unwrap_or_else(settings_path);
    let settings = load_settings_from(&path).with_context(|| format!("Failed to load settings from {}", path.display()))?;

    let operation = cli.command.into_operation()?;
    let result = dispatch(&settings, operation).await;

    let out = if cli.pretty { serde_json::to_string_pretty(&result)? } else { serde_json::to_string(&result)? };
    println!("{}", out);

    if result.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        std::process::exit(1);
    }
    Ok(())
}
