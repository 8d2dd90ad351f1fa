use concord_core::Paths;

use super::start_ecosystem;

pub async fn list() -> anyhow::Result<()> {
    let ecosystem = start_ecosystem(&Paths::new())?;

    for agent in ecosystem.directory().all() {
        println!("{} ({}, {})", agent.agent_id, agent.agent_type, agent.status);
        for cap in &agent.capabilities {
            println!("  - {:<24} {}", cap.name, cap.description);
        }
    }

    ecosystem.shutdown().await;
    Ok(())
}

pub async fn health() -> anyhow::Result<()> {
    let ecosystem = start_ecosystem(&Paths::new())?;
    let report = ecosystem.directory().health_check();
    println!("{}", serde_json::to_string_pretty(&report)?);
    println!(
        "{}",
        if report.is_healthy() { "✓ healthy" } else { "⚠ problems found" }
    );
    ecosystem.shutdown().await;
    Ok(())
}
