//! kiln CLI.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "Multi-platform container image builds", long_about = None)]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, env = "KILN_LOG_FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a pipeline configuration
    Validate {
        /// Path to the configuration file
        #[arg(default_value = "kiln.kdl")]
        path: PathBuf,
    },
    /// Show what a run would build and tag, without fetching or building
    Plan {
        /// Path to the configuration file
        #[arg(default_value = "kiln.kdl")]
        path: PathBuf,

        #[command(flatten)]
        trigger: TriggerArgs,
    },
    /// Build every platform and publish the multi-arch index
    Run {
        /// Path to the configuration file
        #[arg(default_value = "kiln.kdl")]
        path: PathBuf,

        #[command(flatten)]
        trigger: TriggerArgs,

        /// Build everything but push nothing
        #[arg(long)]
        no_push: bool,

        /// Directory holding build cache entries
        #[arg(long, env = "KILN_CACHE_DIR", default_value = ".kiln/cache")]
        cache_dir: PathBuf,

        /// Directory for source checkouts (defaults to the system temp dir)
        #[arg(long, env = "KILN_WORK_DIR")]
        work_dir: Option<PathBuf>,

        /// Buildx builder to use
        #[arg(long, env = "KILN_BUILDX_BUILDER")]
        builder: Option<String>,

        /// Token for cloning private https repositories
        #[arg(long, env = "KILN_GIT_TOKEN", hide_env_values = true)]
        git_token: Option<String>,

        /// Print the final report as JSON on stdout
        #[arg(long)]
        json: bool,
    },
    /// Log in to a registry with KILN_REGISTRY_USERNAME / KILN_REGISTRY_TOKEN
    Login {
        /// Registry host, e.g. ghcr.io
        #[arg(long)]
        registry: String,
    },
}

/// The ref and commit to build; CI environment variables fill in what is missing.
#[derive(Args)]
pub struct TriggerArgs {
    /// Full git ref, e.g. refs/heads/main or refs/tags/v1.2.3
    #[arg(long = "ref")]
    pub git_ref: Option<String>,

    /// Commit SHA
    #[arg(long)]
    pub sha: Option<String>,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let outcome = match cli.command {
        Commands::Validate { path } => commands::validate(&path),
        Commands::Plan { path, trigger } => commands::plan::plan(&path, &trigger),
        Commands::Run {
            path,
            trigger,
            no_push,
            cache_dir,
            work_dir,
            builder,
            git_token,
            json,
        } => {
            let options = commands::run::RunOptions {
                no_push,
                cache_dir,
                work_dir,
                builder,
                git_token,
                json,
            };
            commands::run::run(&path, &trigger, options).await
        }
        Commands::Login { registry } => commands::login(&registry).await,
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(commands::exit_code(&e))
        }
    }
}
