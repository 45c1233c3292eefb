use anyhow::Result;
use colored::Colorize;
use confab_core::{get_config_dir, ConfabConfig};

pub fn handle_config_command(config: &ConfabConfig) -> Result<()> {
    match get_config_dir() {
        Some(dir) => println!(
            "{} {}",
            "# Config directory:".dimmed(),
            dir.join("config.toml").display()
        ),
        None => println!("{}", "# No config directory on this platform".dimmed()),
    }
    println!("{}", config.to_toml()?);
    Ok(())
}
