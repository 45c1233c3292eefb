use anyhow::{bail, Result};
use clap::Args;
use colored::Colorize;
use confab_core::{build_agent, http_capabilities, AgentConfig, ConfabConfig, TriggerModeConfig};
use tracing::info;

use super::ctrl_c;

#[derive(Args, Debug)]
pub struct AgentArgs {
    #[arg(short, long, help = "Teammate name, also used as its speaker label")]
    pub name: String,

    #[arg(long, help = "Unique participant id (defaults to the name)")]
    pub id: Option<String>,

    #[arg(long, help = "Advertised host")]
    pub host: Option<String>,

    #[arg(long, help = "Advertised port")]
    pub port: Option<u16>,

    #[arg(short = 'u', long, help = "Hub WebSocket URL")]
    pub hub_url: Option<String>,

    #[arg(long, help = "Persona instruction file for the responder")]
    pub instruction_file: Option<String>,

    #[arg(long, help = "Instruction file for the turn arbiter")]
    pub moderator_instruction_file: Option<String>,

    #[arg(long, help = "Endpoint that generates replies")]
    pub responder_url: Option<String>,

    #[arg(long, help = "Endpoint that decides whether to speak")]
    pub arbiter_url: Option<String>,

    #[arg(long, env = "CONFAB_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    #[arg(long, help = "When to consider speaking: reactive or periodic")]
    pub mode: Option<String>,

    #[arg(long, help = "Seconds between periodic turn checks")]
    pub interval: Option<u64>,

    #[arg(
        long,
        value_delimiter = ',',
        help = "Speaker names for moderated arbitration, comma separated"
    )]
    pub speakers: Vec<String>,
}

impl AgentArgs {
    fn apply(&self, mut config: AgentConfig) -> Result<AgentConfig> {
        if let Some(url) = &self.hub_url {
            config.hub_url = url.clone();
        }
        if let Some(path) = &self.instruction_file {
            config.instruction_file = path.clone();
        }
        if let Some(path) = &self.moderator_instruction_file {
            config.moderator_instruction_file = path.clone();
        }
        if let Some(url) = &self.responder_url {
            config.responder_url = url.clone();
        }
        if let Some(url) = &self.arbiter_url {
            config.arbiter_url = url.clone();
        }
        if self.api_key.is_some() {
            config.api_key = self.api_key.clone();
        }
        if let Some(mode) = &self.mode {
            config.mode = parse_mode(mode)?;
        }
        if let Some(secs) = self.interval {
            if secs == 0 {
                bail!("--interval must be at least 1 second");
            }
            config.processing_interval_secs = secs;
        }
        if !self.speakers.is_empty() {
            config.speakers = self.speakers.clone();
        }
        Ok(config)
    }
}

fn parse_mode(value: &str) -> Result<TriggerModeConfig> {
    match value.to_lowercase().as_str() {
        "reactive" => Ok(TriggerModeConfig::Reactive),
        "periodic" => Ok(TriggerModeConfig::Periodic),
        other => bail!("Unknown mode '{}', expected reactive or periodic", other),
    }
}

pub async fn handle_agent_command(args: AgentArgs, config: ConfabConfig) -> Result<()> {
    let agent = args.apply(config.agent)?;
    let id = args.id.clone().unwrap_or_else(|| args.name.clone());

    let (arbiter, responder) = http_capabilities(&agent, &args.name).await?;
    let (runtime, coordinator, outbound) = build_agent(&agent, &id, &args.name, arbiter, responder);
    let runtime = runtime.with_address(args.host.clone(), args.port);

    println!(
        "{} {} joining {} ({:?} mode)",
        "Agent".cyan().bold(),
        args.name.bold(),
        agent.hub_url,
        agent.mode
    );
    info!(agent = %args.name, id = %id, hub = %agent.hub_url, "Starting agent");

    runtime.run(coordinator, outbound, ctrl_c()).await?;
    println!("{}", "Agent stopped".dimmed());
    Ok(())
}
