use concord_core::{Config, Paths};
use std::io::{self, Write};

pub async fn run(force: bool) -> anyhow::Result<()> {
    let paths = Paths::new();
    let config_path = paths.config_file();

    if config_path.exists() && !force {
        print!("Config already exists at {}. Overwrite? [y/N] ", config_path.display());
        io::stdout().flush()?;
        let mut answer = String::new();
        io::stdin().read_line(&mut answer)?;
        if !matches!(answer.trim(), "y" | "Y" | "yes") {
            println!("Keeping existing config.");
            return Ok(());
        }
    }

    Config::default().save(&config_path)?;
    println!("✓ Wrote {}", config_path.display());
    println!();
    println!("Next steps:");
    println!("  1. Add an API key under providers in {}", config_path.display());
    println!("  2. Optionally put knowledge entries in {}", paths.knowledge_file().display());
    println!("  3. Run `concord chat`");
    Ok(())
}
