//! CLI entry point: run one deliberation and exit with the decision code.
//!
//! Exit codes: 0 APPROVE, 1 DENY, 2 CONDITIONAL, 3 input/config errors,
//! 4 engine failures.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use magi::concurrency::ConcurrencyController;
use magi::config::OverflowPolicy;
use magi::consensus::ConsensusEngine;
use magi::models::{ConsensusResult, PersonaType, VotingThreshold};
use magi::streaming::{SendFn, StreamingEmitter};
use magi::{Config, MagiError};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Parser)]
#[command(name = "magi", author, version, about = "Three-agent deliberative consensus")]
struct Cli {
    /// The proposal to deliberate on
    prompt: String,

    /// Provider id (anthropic, openai, gemini)
    #[arg(long)]
    provider: Option<String>,

    /// Model id override
    #[arg(long)]
    model: Option<String>,

    /// Debate rounds
    #[arg(long)]
    rounds: Option<u32>,

    /// Decision rule
    #[arg(long, value_parser = parse_threshold)]
    threshold: Option<VotingThreshold>,

    /// Append an instruction to one persona's system prompt
    /// (e.g. --instruct casper="Weigh the migration cost")
    #[arg(long = "instruct", value_parser = parse_instruction, value_name = "PERSONA=TEXT")]
    instruct: Vec<(String, String)>,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
}

fn parse_threshold(raw: &str) -> Result<VotingThreshold, String> {
    raw.parse()
}

fn parse_instruction(raw: &str) -> Result<(String, String), String> {
    let (persona, text) = raw
        .split_once('=')
        .ok_or_else(|| "expected PERSONA=TEXT".to_string())?;
    let persona = persona.trim().to_lowercase();
    if PersonaType::from_config_key(&persona).is_none() {
        return Err(format!(
            "unknown persona '{}': use melchior, balthasar or casper",
            persona
        ));
    }
    if text.trim().is_empty() {
        return Err("instruction text must not be empty".to_string());
    }
    Ok((persona, text.trim().to_string()))
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter =
        EnvFilter::try_from_env("MAGI_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {}", err);
            return ExitCode::from(3);
        }
    };
    if let Some(provider) = cli.provider {
        config.provider = provider;
    }
    if let Some(model) = cli.model {
        config.model = model;
    }
    if let Some(rounds) = cli.rounds {
        config.debate_rounds = rounds.max(1);
    }
    if let Some(threshold) = cli.threshold {
        config.voting_threshold = threshold;
    }
    for (persona, instruction) in cli.instruct {
        config.personas.entry(persona).or_default().instruction = Some(instruction);
    }
    if config.api_key.is_empty() {
        eprintln!("configuration error: MAGI_API_KEY is not set");
        return ExitCode::from(3);
    }

    // Process-wide controller, injected into the engine from here.
    let controller = Arc::new(ConcurrencyController::new(config.llm_concurrency_limit));
    let quiet: SendFn = Arc::new(|_event| Box::pin(async {}));
    let emitter = Arc::new(StreamingEmitter::new(
        config.streaming_queue_size,
        OverflowPolicy::Drop,
        Duration::from_secs(2),
        quiet,
    ));

    let mut engine = match ConsensusEngine::new(config, controller, emitter) {
        Ok(engine) => engine,
        Err(err) => {
            eprintln!("configuration error: {}", err);
            return ExitCode::from(3);
        }
    };

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_cancel.cancel();
        }
    });

    match engine.execute(&cli.prompt, cancel).await {
        Ok(result) => {
            print_result(&result, cli.format);
            ExitCode::from(result.exit_code as u8)
        }
        Err(MagiError::Cancelled) => {
            eprintln!("deliberation cancelled");
            ExitCode::from(4)
        }
        Err(err) => {
            eprintln!("deliberation failed: {}", err);
            ExitCode::from(4)
        }
    }
}

fn print_result(result: &ConsensusResult, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            match serde_json::to_string_pretty(result) {
                Ok(json) => println!("{}", json),
                Err(err) => eprintln!("failed to encode result: {}", err),
            }
        }
        OutputFormat::Text => {
            println!("DECISION: {}", result.decision);
            for (persona, vote) in &result.voting_results {
                println!(
                    "  {}: {} - {}",
                    persona.display_name(),
                    vote.payload.vote,
                    vote.payload.reason
                );
            }
            if !result.all_conditions.is_empty() {
                println!("CONDITIONS:");
                for condition in &result.all_conditions {
                    println!("  - {}", condition);
                }
            }
            if result.partial_results {
                println!("(partial result; excluded: {})", result.excluded.join(", "));
            }
        }
    }
}
