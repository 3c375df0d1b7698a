use std::io::Write;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use courier_agent::tools::ToolRegistry;
use courier_agent::{ChatMessage, EndpointPool, NullHook, TurnOutcome, TurnRequest};
use courier_core::config::CourierConfig;
use courier_core::task::Task;
use courier_gateway::report::{DailyReport, ReportLedger};

#[derive(Parser)]
#[command(name = "courier", about = "Multi-channel chat gateway and agent orchestrator")]
struct Cli {
    /// Path to courier.toml (default: ~/.courier/courier.toml)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Execute one task through the agent loop and print the result.
    Run { task: Vec<String> },
    /// Probe all endpoints and write today's self-check report.
    Selfcheck {
        /// Include per-endpoint request statistics.
        #[arg(long)]
        full: bool,
        /// Reserved: apply automatic fixes for failed checks.
        #[arg(long)]
        fix: bool,
    },
    /// Show endpoint pool status.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = CourierConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!("config load failed ({e}), using defaults");
        CourierConfig::default()
    });

    let pool = EndpointPool::from_config(&config.endpoints)?;

    match cli.command {
        Some(Command::Run { task }) => run_task(&config, &pool, task.join(" ")).await,
        Some(Command::Selfcheck { full, .. }) => selfcheck(&config, &pool, full).await,
        Some(Command::Status) => {
            pool.probe_all().await;
            print_status(&pool);
            Ok(())
        }
        None => interactive(&config, &pool).await,
    }
}

async fn run_task(
    config: &CourierConfig,
    pool: &Arc<EndpointPool>,
    description: String,
) -> anyhow::Result<()> {
    if description.trim().is_empty() {
        anyhow::bail!("empty task description");
    }

    pool.probe_all().await;
    let registry = ToolRegistry::with_builtins();
    let mut task = Task::new(description).with_max_attempts(3);

    let result = courier_agent::ralph::run_ralph_loop(&mut task, 10, |task| {
        let pool = Arc::clone(pool);
        let registry = &registry;
        let system = config.agent.system_prompt.clone();
        let agent_cfg = config.agent.clone();
        async move {
            let turn = TurnRequest {
                system,
                history: Vec::new(),
                user_text: task.description.clone(),
                image_blocks: Vec::new(),
                max_tokens: agent_cfg.max_tokens,
                max_iterations: agent_cfg.max_iterations,
                guard_enabled: agent_cfg.guard_enabled,
            };
            match courier_agent::turn::run_turn(
                &pool,
                registry,
                &NullHook,
                &CancellationToken::new(),
                turn,
            )
            .await
            {
                Ok(TurnOutcome::Completed { text, .. }) => Ok(text),
                Ok(TurnOutcome::Cancelled { reason }) => Err(format!("cancelled: {reason}")),
                Err(e) => Err(e.to_string()),
            }
        }
    })
    .await;

    match result.output {
        Some(output) => println!("{output}"),
        None => println!(
            "task did not complete after {} iterations: {}",
            result.iterations,
            result.error.unwrap_or_default()
        ),
    }
    Ok(())
}

async fn selfcheck(
    config: &CourierConfig,
    pool: &Arc<EndpointPool>,
    full: bool,
) -> anyhow::Result<()> {
    pool.probe_all().await;
    let snapshot = pool.snapshot();

    let healthy = snapshot.iter().filter(|e| e.healthy).count();
    let status = if healthy == snapshot.len() {
        "healthy"
    } else if healthy > 0 {
        "degraded"
    } else {
        "unhealthy"
    };

    let mut summary = format!("{healthy}/{} endpoints healthy", snapshot.len());
    if full {
        for ep in &snapshot {
            summary.push_str(&format!(
                "\n- {}: {} ok={} err={}",
                ep.name,
                if ep.healthy { "ok" } else { "down" },
                ep.requests_ok,
                ep.requests_err
            ));
        }
    }

    let report = DailyReport {
        date: chrono::Utc::now().date_naive().format("%Y-%m-%d").to_string(),
        status: status.to_string(),
        summary: summary.clone(),
        checks: serde_json::to_value(&snapshot)?,
        reported: false,
    };
    ReportLedger::new(config.gateway.report_dir.clone()).write(&report)?;

    println!("self-check: {status}\n{summary}");
    Ok(())
}

fn print_status(pool: &Arc<EndpointPool>) {
    println!("endpoints:");
    for ep in pool.snapshot() {
        let mut line = format!(
            "  {} [{}] {} (priority {})",
            ep.name,
            if ep.healthy { "ok" } else { "down" },
            ep.model,
            ep.priority
        );
        if ep.current {
            line.push_str(" ← current");
        }
        if ep.pinned {
            line.push_str(" (pinned)");
        }
        println!("{line}");
    }
}

async fn interactive(config: &CourierConfig, pool: &Arc<EndpointPool>) -> anyhow::Result<()> {
    pool.probe_all().await;
    let registry = ToolRegistry::with_builtins();
    let commands = courier_gateway::commands::CommandInterceptor::new(Arc::clone(pool));
    let mut history: Vec<ChatMessage> = Vec::new();

    println!("courier interactive — /help for commands, /exit to quit");

    let stdin = std::io::stdin();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        match input {
            "/exit" | "/quit" => break,
            "/help" => {
                println!(
                    "/help /status /selfcheck /clear /exit /quit\n\
                     /model /switch [name] /priority /restore /cancel"
                );
                continue;
            }
            "/status" => {
                print_status(pool);
                continue;
            }
            "/selfcheck" => {
                selfcheck(config, pool, false).await?;
                continue;
            }
            "/clear" => {
                history.clear();
                println!("(history cleared)");
                continue;
            }
            _ => {}
        }

        // Model-switch commands and their confirm flows stay out of band.
        if let Some(reply) = commands.handle("cli", input) {
            println!("{reply}");
            continue;
        }

        let turn = TurnRequest {
            system: config.agent.system_prompt.clone(),
            history: history.clone(),
            user_text: input.to_string(),
            image_blocks: Vec::new(),
            max_tokens: config.agent.max_tokens,
            max_iterations: config.agent.max_iterations,
            guard_enabled: config.agent.guard_enabled,
        };

        match courier_agent::turn::run_turn(
            pool,
            &registry,
            &NullHook,
            &CancellationToken::new(),
            turn,
        )
        .await
        {
            Ok(TurnOutcome::Completed { text, .. }) => {
                println!("{text}");
                history.push(ChatMessage::user(input));
                history.push(ChatMessage::assistant(text));
            }
            Ok(TurnOutcome::Cancelled { reason }) => println!("(cancelled: {reason})"),
            Err(e) => println!("(error: {e})"),
        }
    }

    Ok(())
}
