mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use primitives_common::config::Backend;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "primitives-cli")]
#[command(about = "ProgramPrimitives sandbox CLI - run, test and grade code locally", long_about = None)]
struct Cli {
    /// Execution backend (overrides SANDBOX_BACKEND)
    #[arg(long, global = true, value_enum)]
    backend: Option<BackendArg>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendArg {
    Process,
    Docker,
}

impl From<BackendArg> for Backend {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Process => Backend::Process,
            BackendArg::Docker => Backend::Docker,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run a program once and print its output
    Run {
        /// Language (javascript, python, go)
        #[arg(short, long)]
        language: String,

        /// Source file
        #[arg(short, long)]
        file: PathBuf,

        /// Text passed on stdin
        #[arg(short, long, conflicts_with = "input_file")]
        input: Option<String>,

        /// File whose contents are passed on stdin
        #[arg(long)]
        input_file: Option<PathBuf>,
    },

    /// Run a program against test cases
    Test {
        #[arg(short, long)]
        language: String,

        #[arg(short, long)]
        file: PathBuf,

        /// JSON file with test cases
        #[arg(short, long)]
        cases: PathBuf,
    },

    /// Run test cases and compute score and XP
    Submit {
        #[arg(short, long)]
        language: String,

        #[arg(short, long)]
        file: PathBuf,

        #[arg(short, long)]
        cases: PathBuf,

        /// Hints used
        #[arg(long, default_value = "0")]
        hints: u32,

        /// Seconds spent on the exercise
        #[arg(long, default_value = "0")]
        time_spent: u32,

        /// Expected completion time in minutes
        #[arg(long, default_value = "10")]
        expected_minutes: u32,
    },

    /// Run only the static pre-check
    Check {
        #[arg(short, long)]
        language: String,

        #[arg(short, long)]
        file: PathBuf,
    },

    /// List configured languages and their recipes
    Languages,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = commands::load_config(cli.backend.map(Backend::from))?;

    match cli.command {
        Commands::Run {
            language,
            file,
            input,
            input_file,
        } => {
            commands::run(&config, &language, &file, input, input_file.as_deref()).await?;
        }
        Commands::Test { language, file, cases } => {
            commands::test(&config, &language, &file, &cases).await?;
        }
        Commands::Submit {
            language,
            file,
            cases,
            hints,
            time_spent,
            expected_minutes,
        } => {
            commands::submit(
                &config,
                &language,
                &file,
                &cases,
                hints,
                time_spent,
                expected_minutes,
            )
            .await?;
        }
        Commands::Check { language, file } => {
            commands::check(&config, &language, &file)?;
        }
        Commands::Languages => {
            commands::languages(&config)?;
        }
    }

    Ok(())
}
