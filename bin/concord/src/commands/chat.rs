use std::io::{self, Write};

use concord_agent::{Ecosystem, HandleOutcome, HealthMonitor, OutcomeStatus};
use concord_core::Paths;
use serde_json::Map;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use super::start_ecosystem;

fn print_outcome(outcome: &HandleOutcome, explain: bool) -> anyhow::Result<()> {
    match outcome.status {
        OutcomeStatus::Ok => println!("{}", outcome.response),
        OutcomeStatus::Degraded => println!("{} (degraded)", outcome.response),
        OutcomeStatus::Error => println!("⚠ {}", outcome.response),
    }
    if explain {
        println!("{}", serde_json::to_string_pretty(&outcome.rationale)?);
    }
    Ok(())
}

async fn ask(ecosystem: &Ecosystem, input: &str, session: &str, explain: bool) -> anyhow::Result<()> {
    match ecosystem.handle(input, Some(session), Map::new()).await {
        Some(outcome) => print_outcome(&outcome, explain),
        None => anyhow::bail!("orchestrator is not running"),
    }
}

pub async fn run(message: Option<String>, session: String, explain: bool) -> anyhow::Result<()> {
    let ecosystem = start_ecosystem(&Paths::new())?;

    if let Some(message) = message {
        let result = ask(&ecosystem, &message, &session, explain).await;
        ecosystem.shutdown().await;
        return result;
    }

    let shutdown = CancellationToken::new();
    let monitor = HealthMonitor::new(
        ecosystem.directory().clone(),
        ecosystem.bus().clone(),
        &ecosystem.config().directory,
        &ecosystem.config().bus,
    )
    .spawn(shutdown.clone());

    println!("concord interactive mode (/quit to exit, /status for system status)");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input == "/quit" || input == "/exit" {
            break;
        }
        if input == "/status" {
            println!("{}", serde_json::to_string_pretty(&ecosystem.status())?);
            continue;
        }
        if let Err(e) = ask(&ecosystem, input, &session, explain).await {
            println!("⚠ {}", e);
        }
    }

    shutdown.cancel();
    let _ = monitor.await;
    ecosystem.shutdown().await;
    Ok(())
}
