//! Troupe REPL.
//!
//! Reads one line, runs one request through a default assistant team, and
//! streams the run's events to the terminal. `exit`, `quit`, or `bye`
//! leaves the loop.

#![allow(clippy::print_stdout, clippy::print_stderr)] // CLI program intentionally uses stdout

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader};
use tracing_subscriber::EnvFilter;

use troupe::llm::openai::{OpenAiBackend, OpenAiConfig, OpenAiEmbedder};
use troupe::{AgentSpec, EventBody, Runtime, RuntimeConfig, TeamSpec};

/// Troupe - a team-of-agents assistant in your terminal
#[derive(Parser)]
#[command(name = "troupe")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// SQLite database path
    #[arg(long, env = "DATABASE_URL", default_value = "troupe.db")]
    database: String,

    /// OpenAI-compatible API base URL
    #[arg(long, env = "LLM_BASE_URL", default_value = "https://api.openai.com/v1")]
    base_url: String,

    /// Model for every agent
    #[arg(short, long, env = "LLM_MODEL", default_value = "gpt-4o-mini")]
    model: String,

    /// User identity to run as
    #[arg(long, default_value = "local-user")]
    user: String,

    /// Session id to resume
    #[arg(short, long)]
    session: Option<String>,
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("troupe={level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn build_runtime(cli: &Cli) -> Result<Runtime, String> {
    let api_key = std::env::var("LLM_PROVIDER_KEY")
        .map_err(|_| "LLM_PROVIDER_KEY is not set".to_owned())?;

    let config = RuntimeConfig {
        database_url: cli.database.clone(),
        llm_provider_key: api_key.clone(),
        ..RuntimeConfig::default()
    };

    let backend = OpenAiBackend::new(OpenAiConfig {
        api_key,
        base_url: cli.base_url.clone(),
        model: cli.model.clone(),
        timeout: config.run_timeout + Duration::from_secs(10),
        ..OpenAiConfig::default()
    })
    .map_err(|e| e.to_string())?;
    let embedder = OpenAiEmbedder::new(backend.clone(), config.embedding_dim);

    let team = TeamSpec::new("assistant", "Assistant Team")
        .instructions(
            "You are a personal assistant leading two specialists. Delegate to them \
             when the user's request needs recall or document lookup; otherwise \
             answer directly.",
        )
        .member(
            AgentSpec::new("recall", "Recall Agent")
                .role("Looks up what is known about the user from past conversations")
                .instructions("Answer using the memory_search tool. Be concise.")
                .tool("memory_search"),
        )
        .member(
            AgentSpec::new("librarian", "Librarian Agent")
                .role("Finds passages in the user's uploaded documents")
                .instructions("Answer using the knowledge_search tool. Quote the source.")
                .tool("knowledge_search"),
        );

    Runtime::builder()
        .config(config)
        .backend(Arc::new(backend))
        .embedder(Arc::new(embedder))
        .team(team)
        .build()
        .await
        .map_err(|e| e.to_string())
}

async fn stream_run(
    runtime: &Runtime,
    user: &str,
    session: &mut Option<String>,
    input: &str,
) -> Result<(), String> {
    let mut handle = runtime
        .run(user, session.as_deref(), input, "assistant")
        .await
        .map_err(|e| e.to_string())?;

    let mut stdout = tokio::io::stdout();
    while let Some(event) = handle.next_event().await {
        match &event.body {
            EventBody::ContentDelta { text } => {
                let _ = stdout.write_all(text.as_bytes()).await;
                let _ = stdout.flush().await;
            }
            EventBody::MemberDelegation { to, task, .. } => {
                println!("\n· delegating to {to}: {task}");
            }
            EventBody::MemberCompleted { member_id, status, .. } => {
                println!("· {member_id} {status}");
            }
            EventBody::ToolCallStarted { tool_name, .. } => {
                println!("\n· calling {tool_name}");
            }
            EventBody::Error { message, .. } => {
                eprintln!("\n! {message}");
            }
            EventBody::RunFailed { error_kind, message } => {
                eprintln!("\nrun failed ({error_kind}): {message}");
            }
            EventBody::RunCancelled {} => {
                eprintln!("\nrun cancelled");
            }
            EventBody::RunCompleted { .. } => {
                println!();
            }
            _ => {}
        }
    }

    // Keep the session for the next turn.
    if session.is_none() {
        let run = runtime
            .records()
            .get_run(handle.run_id())
            .await
            .ok()
            .flatten();
        *session = run.map(|r| r.session_id);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let runtime = match build_runtime(&cli).await {
        Ok(runtime) => runtime,
        Err(message) => {
            eprintln!("configuration error: {message}");
            return ExitCode::from(1);
        }
    };

    let mut session = cli.session.clone();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!("troupe ready - type a request, or exit|quit|bye to leave");
    loop {
        print!("you> ");
        use std::io::Write as _;
        let _ = std::io::stdout().flush();

        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\ninterrupted");
                return ExitCode::from(130);
            }
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break, // EOF
            Err(e) => {
                eprintln!("input error: {e}");
                return ExitCode::from(2);
            }
        };

        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if matches!(input, "exit" | "quit" | "bye") {
            break;
        }

        if let Err(message) = stream_run(&runtime, &cli.user, &mut session, input).await {
            eprintln!("runtime error: {message}");
            return ExitCode::from(2);
        }
    }

    ExitCode::SUCCESS
}
