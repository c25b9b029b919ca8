mod client;
mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use codex_common::types::{JobId, LimitOverrides};
use std::path::PathBuf;

use client::CodexClient;
use commands::RunOptions;

#[derive(Parser)]
#[command(name = "codex")]
#[command(about = "CodeX CLI - Run code in CodeX sandboxes", long_about = None)]
struct Cli {
    /// Gateway base URL
    #[arg(long, env = "CODEX_URL", default_value = "http://127.0.0.1:3000", global = true)]
    url: String,

    /// Username for HTTP Basic auth
    #[arg(short, long, env = "CODEX_USER", default_value = "demo", global = true)]
    user: String,

    /// Password for HTTP Basic auth
    #[arg(short, long, env = "CODEX_PASSWORD", default_value = "demo", hide_env_values = true, global = true)]
    password: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a source file and print its output
    Run {
        /// Source file to execute
        file: PathBuf,

        /// Language (inferred from the file extension when omitted)
        #[arg(short, long)]
        language: Option<String>,

        /// File to feed as stdin ("-" reads this process's stdin)
        #[arg(short, long)]
        stdin: Option<PathBuf>,

        /// Wall-clock limit in milliseconds
        #[arg(long)]
        wall_time_ms: Option<u64>,

        /// CPU-time limit in milliseconds
        #[arg(long)]
        cpu_time_ms: Option<u64>,

        /// Memory limit in MB
        #[arg(long)]
        memory_mb: Option<u64>,

        /// Print the job id and return without waiting
        #[arg(short, long, default_value = "false")]
        detach: bool,
    },

    /// Show a job's state and result
    Status {
        job_id: JobId,
    },

    /// Cancel a queued or running job
    Cancel {
        job_id: JobId,
    },

    /// List supported languages and their default limits
    Languages,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = CodexClient::new(&cli.url, cli.user, cli.password);

    match cli.command {
        Commands::Run {
            file,
            language,
            stdin,
            wall_time_ms,
            cpu_time_ms,
            memory_mb,
            detach,
        } => {
            let code = commands::run(
                &client,
                RunOptions {
                    file: &file,
                    language: language.as_deref(),
                    stdin_file: stdin.as_deref(),
                    limits: LimitOverrides {
                        wall_time_ms,
                        cpu_time_ms,
                        memory_mb,
                    },
                    detach,
                },
            )
            .await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Status { job_id } => {
            commands::status(&client, job_id).await?;
        }
        Commands::Cancel { job_id } => {
            commands::cancel(&client, job_id).await?;
        }
        Commands::Languages => {
            commands::languages(&client).await?;
        }
    }

    Ok(())
}
