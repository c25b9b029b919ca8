// CLI commands for talking to a CodeX gateway
use anyhow::{bail, Context, Result};
use codex_common::types::{ExecutionResult, JobId, JobState, Language, LimitOverrides, TerminalReason};
use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;
use std::time::Duration;

use crate::client::{CodexClient, SubmitBody};

/// Per-request long-poll window while waiting for a job.
const POLL_WAIT: Duration = Duration::from_secs(25);

pub struct RunOptions<'a> {
    pub file: &'a Path,
    pub language: Option<&'a str>,
    pub stdin_file: Option<&'a Path>,
    pub limits: LimitOverrides,
    pub detach: bool,
}

/// Guess the language from a source file's extension.
pub fn infer_language(path: &Path) -> Option<Language> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "py" => Some(Language::Python),
        "cpp" | "cc" | "cxx" | "c++" => Some(Language::Cpp),
        "js" | "mjs" | "cjs" => Some(Language::JavaScript),
        _ => None,
    }
}

/// Submit a file, wait for it to finish and mirror its output and exit status.
pub async fn run(client: &CodexClient, options: RunOptions<'_>) -> Result<i32> {
    let source = fs::read_to_string(options.file)
        .with_context(|| format!("Failed to read {}", options.file.display()))?;

    let language = match options.language {
        Some(name) => name.to_string(),
        None => match infer_language(options.file) {
            Some(lang) => lang.to_string(),
            None => bail!(
                "Cannot infer the language of {}; pass --language",
                options.file.display()
            ),
        },
    };

    let stdin = match options.stdin_file {
        Some(path) if path == Path::new("-") => {
            let mut buf = String::new();
            io::stdin().read_to_string(&mut buf).context("Failed to read stdin")?;
            buf
        }
        Some(path) => fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?,
        None => String::new(),
    };

    let job_id = client
        .submit(&SubmitBody {
            language: &language,
            source: &source,
            stdin: &stdin,
            limits: options.limits,
        })
        .await?;

    if options.detach {
        println!("{}", job_id);
        return Ok(0);
    }
    eprintln!("🚀 Submitted job {} ({})", job_id, language);

    let result = loop {
        let view = client.status(job_id, Some(POLL_WAIT)).await?;
        if let Some(result) = view.result {
            break result;
        }
    };

    print_result(&result)?;
    Ok(exit_status(&result))
}

pub async fn status(client: &CodexClient, job_id: JobId) -> Result<()> {
    let view = client.status(job_id, None).await?;
    println!("Job:       {}", view.job_id);
    println!("Language:  {}", view.language);
    println!("State:     {}", view.state);
    println!("Submitted: {}", view.submitted_at.to_rfc3339());
    println!("Updated:   {}", view.updated_at.to_rfc3339());
    if let Some(result) = view.result {
        println!("Reason:    {}", result.reason);
        if let Some(code) = result.exit_code {
            println!("Exit code: {}", code);
        }
        println!("Duration:  {}ms", result.duration_ms);
        if result.truncated {
            println!("Output:    truncated");
        }
        println!();
        print_result(&result)?;
    }
    Ok(())
}

pub async fn cancel(client: &CodexClient, job_id: JobId) -> Result<()> {
    let response = client.cancel(job_id).await?;
    match response.outcome.as_str() {
        "cancelled" => println!("✅ Job {} cancelled", response.job_id),
        "signalled" => println!("🛑 Job {} is stopping", response.job_id),
        _ => println!("ℹ️  Job {} had already finished", response.job_id),
    }
    Ok(())
}

pub async fn languages(client: &CodexClient) -> Result<()> {
    let languages = client.languages().await?;
    println!(
        "{:<12} {:<8} {:<10} {:>9} {:>9} {:>7}",
        "LANGUAGE", "VERSION", "FILE", "WALL(ms)", "CPU(ms)", "MEM(MB)"
    );
    for info in languages {
        let name = if info.compiled {
            format!("{}*", info.language)
        } else {
            info.language.to_string()
        };
        println!(
            "{:<12} {:<8} {:<10} {:>9} {:>9} {:>7}",
            name,
            info.version,
            info.source_file,
            info.limits.wall_time_ms,
            info.limits.cpu_time_ms,
            info.limits.memory_mb
        );
    }
    println!("\n* compiled before running");
    Ok(())
}

fn print_result(result: &ExecutionResult) -> Result<()> {
    let mut stderr = io::stderr().lock();
    if let Some(compile_output) = result.compile_output.as_deref().filter(|s| !s.is_empty()) {
        stderr.write_all(compile_output.as_bytes())?;
    }
    io::stdout().lock().write_all(result.stdout.as_bytes())?;
    stderr.write_all(result.stderr.as_bytes())?;
    if result.truncated {
        writeln!(stderr, "[output truncated]")?;
    }
    Ok(())
}

/// Process exit status mirroring how the program ended.
pub fn exit_status(result: &ExecutionResult) -> i32 {
    match result.state {
        JobState::Succeeded => 0,
        JobState::TimedOut => 124,
        JobState::Cancelled => 130,
        _ => match (result.reason, result.exit_code) {
            (TerminalReason::RuntimeError, Some(code)) if (1..=255).contains(&code) => code as i32,
            _ => 1,
        },
    }
}
