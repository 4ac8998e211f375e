//! linkrelay CLI - fetch URLs and relay them to cloud storage
//!
//! Each URL is downloaded under the per-user concurrency and bandwidth
//! ceilings, uploaded to Drive, and answered with a sharable link.

mod commands;
mod output;
mod progress;

use anyhow::Result;
use clap::{Parser, Subcommand};
use linkrelay_core::{ceiling_from_signed, NullNotifier, RelayCore, Services, Storage};
use linkrelay_types::Settings;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// linkrelay - fetch a URL, get a share link
#[derive(Parser)]
#[command(name = "linkrelay")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Data directory for linkrelay
    #[arg(long, env = "LINKRELAY_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "human", global = true)]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Commands,
}

/// Per-run settings overrides, layered over the settings file
#[derive(clap::Args, Debug, Default)]
struct Overrides {
    /// Concurrent transfers allowed per user
    #[arg(long, global = true)]
    max_concurrent: Option<usize>,

    /// Per-user bandwidth in bytes/sec (0 or negative = unthrottled)
    #[arg(long, global = true, allow_negative_numbers = true)]
    rate_limit: Option<i64>,

    /// Download chunk size in bytes
    #[arg(long, global = true)]
    chunk_size: Option<usize>,

    /// Overall fetch timeout in seconds
    #[arg(long, global = true)]
    fetch_timeout: Option<u64>,

    /// Where artifacts are kept between download and upload
    #[arg(long, global = true)]
    work_dir: Option<PathBuf>,

    /// JSON file holding the storage access token
    #[arg(long, global = true)]
    token_file: Option<PathBuf>,

    /// Storage access token (takes precedence over the token file)
    #[arg(long, env = "LINKRELAY_ACCESS_TOKEN", global = true, hide_env_values = true)]
    access_token: Option<String>,
}

impl Overrides {
    fn apply(&self, settings: &mut Settings) {
        if let Some(max) = self.max_concurrent {
            settings.max_concurrent_per_user = max;
        }
        if let Some(rate) = self.rate_limit {
            settings.user_rate_limit = ceiling_from_signed(rate);
        }
        if let Some(chunk) = self.chunk_size {
            settings.chunk_size = chunk;
        }
        if let Some(timeout) = self.fetch_timeout {
            settings.fetch_timeout_secs = timeout;
        }
        if let Some(dir) = &self.work_dir {
            settings.work_dir = dir.clone();
        }
        if let Some(path) = &self.token_file {
            settings.drive.token_file = Some(path.clone());
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Table,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch URLs and relay them to storage
    Fetch {
        /// URLs to fetch
        #[arg(required = true)]
        urls: Vec<String>,

        /// User the transfers are accounted to
        #[arg(short, long, default_value = "local")]
        user: String,
    },

    /// Submit `<user> <url>` lines without waiting between them
    Batch {
        /// Input file (stdin when omitted)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// List finished transfers
    History {
        /// Only this user's transfers
        #[arg(short, long)]
        user: Option<String>,

        /// Maximum number of entries
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Show a user's running and recorded transfers
    Stats {
        /// User to report on
        #[arg(short, long, default_value = "local")]
        user: String,
    },

    /// Show/update settings
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get {
        /// Config key
        key: String,
    },

    /// Set a config value
    Set {
        /// Config key
        key: String,

        /// Config value
        value: String,
    },

    /// Show all config
    Show,

    /// Reset to defaults
    Reset,
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose {
            "linkrelay=debug,linkrelay_core=debug"
        } else {
            "warn"
        })
    });

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // Determine data directory
    let data_dir = cli.data_dir.clone().unwrap_or_else(|| {
        dirs::data_dir()
            .map(|d| d.join("linkrelay"))
            .unwrap_or_else(|| PathBuf::from(".linkrelay"))
    });
    let storage = Storage::new(data_dir).await?;

    match cli.command {
        Commands::Config { action } => {
            commands::config_action(&storage, action, cli.output).await?
        }

        Commands::Completions { shell } => {
            use clap::CommandFactory;
            clap_complete::generate(shell, &mut Cli::command(), "linkrelay", &mut std::io::stdout());
        }

        Commands::History { user, limit } => {
            commands::show_history(&storage, user, limit, cli.output).await?
        }

        Commands::Stats { user } => {
            let core = build_core(&storage, &cli.overrides, cli.output).await?;
            commands::show_stats(&core, &storage, user, cli.output).await?
        }

        Commands::Fetch { urls, user } => {
            let core = build_core(&storage, &cli.overrides, cli.output).await?;
            commands::fetch(&core, &user, urls, cli.output).await?
        }

        Commands::Batch { file } => {
            let core = build_core(&storage, &cli.overrides, cli.output).await?;
            commands::batch(&core, file, cli.output).await?
        }
    }

    Ok(())
}

async fn build_core(
    storage: &Storage,
    overrides: &Overrides,
    output: OutputFormat,
) -> Result<RelayCore> {
    let mut settings = storage.load_settings().await?;
    overrides.apply(&mut settings);

    let mut services =
        Services::from_settings(&settings, storage, overrides.access_token.clone()).await?;
    // Keep machine-readable output free of status chatter
    if output == OutputFormat::Json {
        services.notifier = Arc::new(NullNotifier);
    }
    Ok(RelayCore::new(settings, services))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_negative_rate_means_unthrottled() {
        let cli = Cli::try_parse_from([
            "linkrelay",
            "--rate-limit",
            "-1",
            "--max-concurrent",
            "3",
            "fetch",
            "https://host/a.bin",
        ])
        .unwrap();

        let mut settings = Settings::default();
        cli.overrides.apply(&mut settings);
        assert_eq!(settings.user_rate_limit, 0);
        assert_eq!(settings.max_concurrent_per_user, 3);
    }

    #[test]
    fn test_stats_defaults_to_local_user() {
        let cli = Cli::try_parse_from(["linkrelay", "stats"]).unwrap();
        assert!(matches!(cli.command, Commands::Stats { user } if user == "local"));

        let cli = Cli::try_parse_from(["linkrelay", "--output", "json", "stats", "-u", "42"]).unwrap();
        assert_eq!(cli.output, OutputFormat::Json);
        assert!(matches!(cli.command, Commands::Stats { user } if user == "42"));
    }
}
