//! Ralph for Codex - autonomous agent loop control
//!
//! Headless front end: runs the loop against a project directory, reports
//! persisted state, and resets the circuit breaker.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use ralph_codex::backend::BackendEvent;
use ralph_codex::circuit::BreakerStats;
use ralph_codex::r#loop::context::find_project_root;
use ralph_codex::r#loop::rate_limiter::RateLimiterStats;
use ralph_codex::{
    BreakerState, CircuitBreaker, CodexCliRunner, EventSink, FileStateStore, LogLevel, LoopConfig,
    LoopController, LoopEvent, ProjectContext, RalphError, RateLimiter, StateStore,
};

#[derive(Parser)]
#[command(name = "ralph")]
#[command(version = "0.1.0")]
#[command(about = "Autonomous Codex loop with rate limiting and circuit breaking", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Project directory (defaults to the nearest enclosing project)
    #[arg(short, long, global = true)]
    project: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the loop until the fix plan is done or a gate closes
    Run {
        /// Backend calls allowed per hour
        #[arg(long, env = "RALPH_MAX_CALLS", value_name = "N")]
        calls: Option<u32>,

        /// Backend timeout per call, in seconds
        #[arg(long, env = "RALPH_BACKEND_TIMEOUT", value_name = "SECS")]
        timeout: Option<u64>,

        /// Maximum loop iterations (defaults to the call budget)
        #[arg(long, value_name = "N")]
        max_loops: Option<u32>,

        /// Prompt file relative to the project
        #[arg(long, value_name = "FILE")]
        prompt: Option<String>,

        /// Print loop events as JSON lines instead of text
        #[arg(long)]
        json_events: bool,
    },

    /// Show circuit breaker, call budget and session state
    Status {
        /// Output JSON
        #[arg(long)]
        json: bool,
    },

    /// Reset the circuit breaker to CLOSED
    ResetCircuit,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose {
        "ralph_codex=debug,info"
    } else {
        "ralph_codex=info,warn"
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let project = match cli.project {
        Some(path) => path,
        None => {
            let cwd = std::env::current_dir()?;
            find_project_root(&cwd).unwrap_or(cwd)
        }
    };
    let project_path = project.canonicalize().unwrap_or(project);

    if !project_path.is_dir() {
        eprintln!(
            "{} Project directory does not exist: {}",
            "Error:".red().bold(),
            project_path.display()
        );
        std::process::exit(1);
    }

    let result = match cli.command {
        Commands::Run {
            calls,
            timeout,
            max_loops,
            prompt,
            json_events,
        } => {
            let overrides = RunOverrides {
                calls,
                timeout,
                max_loops,
                prompt,
            };
            run_loop(&project_path, overrides, json_events, cli.verbose).await
        }
        Commands::Status { json } => show_status(&project_path, json),
        Commands::ResetCircuit => reset_circuit(&project_path),
    };

    match result {
        Ok(()) => Ok(()),
        Err(RalphError::Cancelled) => {
            println!("{}", "Interrupted, state saved.".yellow());
            Ok(())
        }
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            if let RalphError::CircuitHalted { .. } = e {
                eprintln!(
                    "  Run {} after fixing the cause.",
                    "ralph reset-circuit".cyan()
                );
            } else if e.is_fatal() {
                eprintln!("  {}", "Fix the problem above before running again.".yellow());
            }
            std::process::exit(e.exit_code());
        }
    }
}

// ============================================================================
// run
// ============================================================================

struct RunOverrides {
    calls: Option<u32>,
    timeout: Option<u64>,
    max_loops: Option<u32>,
    prompt: Option<String>,
}

fn load_config(project: &Path, overrides: RunOverrides) -> ralph_codex::Result<LoopConfig> {
    let mut config = LoopConfig::load(project)?;
    if let Some(calls) = overrides.calls {
        config = config.with_max_calls(calls);
    }
    if let Some(secs) = overrides.timeout {
        config = config.with_backend_timeout_secs(secs);
    }
    if let Some(loops) = overrides.max_loops {
        config = config.with_max_loops(loops);
    }
    if let Some(prompt) = overrides.prompt {
        config = config.with_prompt_file(prompt);
    }
    config.validate()?;
    Ok(config)
}

async fn run_loop(
    project: &Path,
    overrides: RunOverrides,
    json_events: bool,
    verbose: bool,
) -> ralph_codex::Result<()> {
    let config = load_config(project, overrides)?;

    let context = ProjectContext::new(project)
        .with_prompt_file(&config.prompt_file)
        .with_plan_file(&config.plan_file);
    context.validate()?;

    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::for_project(project));
    let runner = CodexCliRunner::new(project, Arc::clone(&store)).with_binary(&config.backend_binary);

    let sink: EventSink = if json_events {
        Arc::new(print_json_event)
    } else {
        Arc::new(move |event: LoopEvent| render_event(&event, verbose))
    };

    let mut controller =
        LoopController::new(config, Arc::new(runner), Arc::new(context), store).with_event_sink(sink);

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        signal_cancel.cancel();
    });

    let result = controller.run(&cancel).await;

    if cancel.is_cancelled() {
        if let Err(e) = controller.graceful_exit().await {
            warn!("Graceful exit failed: {}", e);
        }
    }

    let stats = controller.stats();
    if !json_events {
        println!();
        println!(
            "{} {} loops ({} ok, {} failed), {} calls used, circuit {}",
            "Summary:".bold(),
            stats.successful_loops + stats.failed_loops,
            stats.successful_loops,
            stats.failed_loops,
            stats.rate_limiter.calls_made,
            paint_state(stats.circuit_breaker.state)
        );
    }

    result
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn print_json_event(event: LoopEvent) {
    match serde_json::to_string(&event) {
        Ok(line) => println!("{line}"),
        Err(e) => warn!("Failed to serialize event: {}", e),
    }
}

fn render_event(event: &LoopEvent, verbose: bool) {
    match event {
        LoopEvent::Log { level, message } => match level {
            LogLevel::Info => println!("{} {}", "→".cyan(), message),
            LogLevel::Success => println!("{} {}", "✓".green().bold(), message),
            LogLevel::Warn => println!("{} {}", "⚠".yellow().bold(), message.yellow()),
            LogLevel::Error => println!("{} {}", "✗".red().bold(), message.red()),
        },
        LoopEvent::LoopUpdate {
            loop_index,
            calls_used,
            status,
            circuit_state,
        } => {
            if verbose {
                println!(
                    "{}",
                    format!(
                        "[loop {}] {} (calls {}, circuit {})",
                        loop_index + 1,
                        status,
                        calls_used,
                        circuit_state
                    )
                    .dimmed()
                );
            }
        }
        LoopEvent::Backend(backend) => match backend {
            BackendEvent::Reasoning { text } => println!("  {}", text.dimmed().italic()),
            BackendEvent::Message { text } => println!("  {text}"),
            BackendEvent::Delta { text } => print!("{text}"),
            BackendEvent::ToolCall { .. } => println!("  {}", backend.to_string().blue()),
            BackendEvent::ToolResult { .. } => println!("  {}", backend.to_string().dimmed()),
            BackendEvent::Lifecycle { .. } => {
                if verbose {
                    println!("  {}", backend.to_string().dimmed());
                }
            }
        },
    }
}

fn paint_state(state: BreakerState) -> colored::ColoredString {
    match state {
        BreakerState::Stable => state.as_str().green(),
        BreakerState::Probing => state.as_str().yellow(),
        BreakerState::Halted => state.as_str().red().bold(),
    }
}

// ============================================================================
// status / reset-circuit
// ============================================================================

#[derive(Serialize)]
struct StatusReport {
    circuit_breaker: BreakerStats,
    rate_limiter: RateLimiterStats,
    exit_signals: Vec<String>,
    session_id: Option<String>,
}

fn show_status(project: &Path, json: bool) -> ralph_codex::Result<()> {
    let config = LoopConfig::load(project)?;
    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::for_project(project));

    let breaker = CircuitBreaker::load(config.breaker_config(), Arc::clone(&store));
    let limiter = RateLimiter::with_store(
        config.max_calls_per_hour,
        config.rate_window(),
        Arc::clone(&store),
    );

    let report = StatusReport {
        circuit_breaker: breaker.stats(),
        rate_limiter: limiter.stats(),
        exit_signals: store.load_exit_signals().unwrap_or_default(),
        session_id: store.load_session_id().unwrap_or_default(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let cb = &report.circuit_breaker;
    println!("{}", "Circuit Breaker".bold());
    println!("  State:                {}", paint_state(cb.state));
    println!(
        "  Consecutive failures: {}/{}",
        cb.consecutive_failures, cb.failure_threshold
    );
    println!(
        "  Window:               {}/{} loops, {} files changed",
        cb.window_fill, cb.window_size, cb.files_changed_in_window
    );
    if let Some(reason) = &cb.reason {
        println!("  Reason:               {reason}");
    }
    println!("  Total halts:          {}", cb.total_halts);

    let rl = &report.rate_limiter;
    println!();
    println!("{}", "Call Budget".bold());
    println!("  Calls:                {}/{}", rl.calls_made, rl.limit);
    println!("  Resets in:            {}s", rl.resets_in_secs);

    println!();
    println!("{}", "Session".bold());
    println!(
        "  Codex thread:         {}",
        report.session_id.as_deref().unwrap_or("none")
    );
    println!("  Exit signals:         {}", report.exit_signals.len());

    Ok(())
}

fn reset_circuit(project: &Path) -> ralph_codex::Result<()> {
    let config = LoopConfig::load(project)?;
    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::for_project(project));
    let mut breaker = CircuitBreaker::load(config.breaker_config(), store);

    let previous = breaker.state();
    breaker.reset()?;

    println!(
        "{} Circuit breaker reset ({} -> {})",
        "✓".green().bold(),
        paint_state(previous),
        paint_state(breaker.state())
    );
    Ok(())
}
