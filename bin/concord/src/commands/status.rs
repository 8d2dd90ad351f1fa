use concord_core::Paths;

use super::load_config;

pub async fn run() -> anyhow::Result<()> {
    let paths = Paths::new();

    println!("concord status");
    println!("==============");
    println!();

    let config_path = paths.config_file();
    let config_exists = config_path.exists();
    println!(
        "Config:    {} {}",
        config_path.display(),
        if config_exists { "✓" } else { "✗ (not found, using defaults)" }
    );
    let knowledge_path = paths.knowledge_file();
    println!(
        "Knowledge: {} {}",
        knowledge_path.display(),
        if knowledge_path.exists() { "✓" } else { "✗ (not found)" }
    );

    let config = load_config(&paths)?;
    println!("Model:     {}", config.agents.defaults.model);
    println!();

    println!("Providers:");
    let mut names: Vec<&String> = config.providers.keys().collect();
    names.sort();
    for name in names {
        let status = match config.get_provider(name) {
            Some(p) if !p.api_key.is_empty() => "✓ configured",
            _ => "✗ no key",
        };
        println!("  {:<12} {}", name, status);
    }
    match config.get_api_key() {
        Some((name, _)) => println!("\nActive provider: {}", name),
        None => println!("\n⚠ No provider configured with API key"),
    }

    println!();
    println!("Agents:");
    for agent_type in &config.agents.enabled {
        println!("  {}", agent_type);
    }

    println!();
    println!("Routing:");
    println!("  threshold       {}", config.routing.routing_threshold);
    println!("  fast accept     {}", config.routing.fast_accept_threshold);
    println!("  max handoffs    {}", config.routing.max_handoffs);
    Ok(())
}
