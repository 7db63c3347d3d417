use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use crossbeam_channel::bounded;
use tracing::{info, warn};

mod config;
mod logging;
mod producer;
mod providers;
mod render;
mod signal;
mod stream;
mod transcript;

use config::AppConfig;
use producer::{spawn_producer, FragmentSender};
use providers::Provider;
use render::TerminalRenderer;
use stream::{BlockKind, CancelToken, StreamCoordinator, StreamOutcome};
use transcript::{StoredTurn, TranscriptSaver, TranscriptStore};

const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
const DEFAULT_HISTORY: usize = 5;
const USAGE: &str = "usage: fencestream [--provider claude|simulated] [--no-transcript] <prompt...>
       fencestream --history [N]
       fencestream --clear-history
       fencestream --version";

#[derive(Debug, PartialEq, Eq)]
enum Invocation {
    Version,
    History(usize),
    ClearHistory,
    Prompt {
        prompt: String,
        provider: Option<Provider>,
        transcript: bool,
    },
}

fn parse_args(args: &[String]) -> std::result::Result<Invocation, String> {
    let mut provider = None;
    let mut transcript = true;
    let mut words: Vec<&str> = Vec::new();
    let mut iter = args.iter().map(String::as_str);

    while let Some(arg) = iter.next() {
        if !words.is_empty() {
            words.push(arg);
            continue;
        }
        match arg {
            "--version" | "-v" => return Ok(Invocation::Version),
            "--history" => {
                let count = match iter.next() {
                    Some(raw) => raw
                        .parse::<usize>()
                        .map_err(|_| format!("invalid history count: {raw}"))?,
                    None => DEFAULT_HISTORY,
                };
                return Ok(Invocation::History(count));
            }
            "--clear-history" => return Ok(Invocation::ClearHistory),
            "--provider" | "-p" => {
                let raw = iter.next().ok_or("--provider needs a value")?;
                provider =
                    Some(Provider::parse(raw).ok_or_else(|| format!("unknown provider: {raw}"))?);
            }
            "--no-transcript" => transcript = false,
            "--" => words.extend(iter.by_ref()),
            unknown if unknown.starts_with("--") => {
                return Err(format!("unknown argument: {unknown}"));
            }
            word => words.push(word),
        }
    }

    let prompt = words.join(" ");
    if prompt.trim().is_empty() {
        return Err("missing prompt".to_string());
    }
    Ok(Invocation::Prompt {
        prompt,
        provider,
        transcript,
    })
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let invocation = match parse_args(&args) {
        Ok(invocation) => invocation,
        Err(msg) => {
            eprintln!("{msg}");
            eprintln!("{USAGE}");
            std::process::exit(2);
        }
    };

    let mut config = AppConfig::load()?;
    match logging::init(&config.log_filter) {
        Ok(path) => info!(path = %path.display(), version = APP_VERSION, "logging started"),
        Err(err) => eprintln!("logging disabled: {err:#}"),
    }

    match invocation {
        Invocation::Version => {
            println!("fencestream {}", APP_VERSION);
            Ok(())
        }
        Invocation::History(count) => print_history(&config, count),
        Invocation::ClearHistory => {
            TranscriptStore::open_default()?
                .clear_session(&config.session_id)
                .context("clear history")?;
            println!("cleared history for session {}", config.session_id);
            Ok(())
        }
        Invocation::Prompt {
            prompt,
            provider,
            transcript,
        } => {
            if let Some(provider) = provider {
                config.provider = provider;
            }
            config.transcript &= transcript;
            let outcome = run_prompt(&config, &prompt)?;
            std::process::exit(exit_code(&outcome));
        }
    }
}

fn run_prompt(config: &AppConfig, prompt: &str) -> Result<StreamOutcome> {
    let provider = config.provider;
    if let Some(binary) = provider.binary() {
        if !command_available(binary) {
            bail!("{} not available on PATH", binary);
        }
    }

    let cancel = CancelToken::new();
    let child_pids = Arc::new(Mutex::new(Vec::new()));
    signal::install_interrupt_handler(cancel.clone())?;

    let saver = if config.transcript {
        match TranscriptStore::open_default()
            .and_then(|store| TranscriptSaver::begin(store, &config.session_id, prompt))
        {
            Ok(saver) => {
                info!(session = %config.session_id, turn = saver.turn(), "recording transcript");
                Some(saver)
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "transcript disabled");
                None
            }
        }
    } else {
        None
    };
    let renderer = TerminalRenderer::new(std::io::stdout(), render::terminal_width());
    let mut coordinator = StreamCoordinator::new(config.stream.clone(), (renderer, saver));

    let (tx, rx) = bounded(config.stream.capacity());
    info!(provider = provider.as_str(), prompt_len = prompt.len(), "starting stream");
    let producer = spawn_producer(
        provider,
        prompt.to_string(),
        FragmentSender::new(tx),
        child_pids.clone(),
        Duration::from_millis(config.simulated_delay_ms),
    );

    let outcome = coordinator.run(&rx, &cancel).context("stream coordinator")?;
    // A producer blocked on a full channel sees the hang-up and stops.
    drop(rx);
    if outcome == StreamOutcome::Cancelled {
        signal::terminate_children(&child_pids);
    }
    if producer.join().is_err() {
        warn!("producer thread panicked");
    }
    Ok(outcome)
}

fn exit_code(outcome: &StreamOutcome) -> i32 {
    match outcome {
        StreamOutcome::Completed => 0,
        StreamOutcome::Failed(_) => 1,
        StreamOutcome::Cancelled => 130,
    }
}

fn print_history(config: &AppConfig, count: usize) -> Result<()> {
    let store = TranscriptStore::open_default()?;
    let turns = store
        .recent_turns(&config.session_id, count)
        .context("load history")?;
    let mut out = std::io::stdout().lock();
    if turns.is_empty() {
        writeln!(out, "no history for session {}", config.session_id)?;
        return Ok(());
    }
    let text = format_history(&turns, render::terminal_width());
    out.write_all(text.as_bytes())?;
    Ok(())
}

fn format_history(turns: &[StoredTurn], width: usize) -> String {
    let mut text = String::new();
    for turn in turns {
        let outcome = turn.outcome.as_deref().unwrap_or("unfinished");
        text.push_str(&format!("#{} > {} [{}]\n", turn.turn, turn.prompt, outcome));
        for block in &turn.blocks {
            match block.kind {
                BlockKind::Prose => text.push_str(&block.content),
                BlockKind::Thinking => {
                    for line in block.content.lines() {
                        text.push_str(&format!("  | {line}\n"));
                    }
                }
                BlockKind::Code => {
                    if !text.ends_with('\n') {
                        text.push('\n');
                    }
                    let language = block.language.as_deref().unwrap_or("text");
                    text.push_str(&render::code_header(language, width));
                    text.push('\n');
                    text.push_str(&block.content);
                    if !block.content.ends_with('\n') {
                        text.push('\n');
                    }
                    text.push_str(&render::code_footer(width));
                    text.push('\n');
                }
            }
        }
        if !text.ends_with('\n') {
            text.push('\n');
        }
        text.push('\n');
    }
    text
}

fn command_available(bin: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    for dir in std::env::split_paths(&path) {
        let full = dir.join(bin);
        if is_executable(&full) {
            return true;
        }
    }
    false
}

fn is_executable(path: &Path) -> bool {
    let Ok(meta) = fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    meta.permissions().mode() & 0o111 != 0
}
