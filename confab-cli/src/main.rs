use clap::{Parser, Subcommand};
use colored::Colorize;
use confab_core::{get_config_dir, CliErrorDisplay, ConfabConfig, ConfabError, LoggingConfig};
use std::process::ExitCode;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

use commands::{
    handle_agent_command, handle_client_command, handle_config_command, handle_hub_command,
    AgentArgs, ClientArgs, HubArgs,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const NAME: &str = env!("CARGO_PKG_NAME");

#[derive(Parser)]
#[command(name = "confab")]
#[command(version = VERSION)]
#[command(about = "Confab - a shared group chat for humans and turn-taking AI teammates")]
#[command(long_about = r#"
Confab runs a hub that relays one shared conversation between human terminal
clients and autonomous AI teammates. Before a teammate speaks, an arbiter
decides whether it is that teammate's turn.

Start the hub with 'confab hub', join as a human with 'confab client --name <you>'
and add teammates with 'confab agent --name <name> --responder-url ... --arbiter-url ...'.
"#)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true, help = "Enable debug logging")]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run the hub that relays messages between participants")]
    Hub(HubArgs),

    #[command(about = "Join the conversation as a human participant")]
    Client(ClientArgs),

    #[command(about = "Run an AI teammate that speaks when the arbiter allows it")]
    Agent(AgentArgs),

    #[command(about = "Print the effective configuration as TOML")]
    Config,

    #[command(about = "Show version information")]
    Version {
        #[arg(short, long)]
        detailed: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match ConfabConfig::load() {
        Ok(config) => config,
        Err(e) => return report_error(&ConfabError::from(e)),
    };

    init_logging(cli.verbose, &config.logging);

    match run(cli, config).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => match e.downcast_ref::<ConfabError>() {
            Some(err) => report_error(err),
            None => {
                eprintln!("{}: {}", "Error".red().bold(), e);
                ExitCode::FAILURE
            }
        },
    }
}

/// Exit status for a failed run: 2 when the failure needs operator action
/// before a retry can succeed, 1 otherwise.
fn exit_status(err: &ConfabError) -> u8 {
    if err.is_fatal() {
        2
    } else {
        1
    }
}

fn report_error(err: &ConfabError) -> ExitCode {
    eprintln!("{}: {}", "Error".red().bold(), CliErrorDisplay::new(err));
    if err.is_config_error() {
        if let Some(dir) = get_config_dir() {
            eprintln!(
                "  {} {}",
                "Config file:".dimmed(),
                dir.join("config.toml").display()
            );
        }
    }
    ExitCode::from(exit_status(err))
}

fn init_logging(verbose: bool, logging: &LoggingConfig) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&logging.level))
            .unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    let json_layer = logging
        .json_format
        .then(|| fmt::layer().json().with_writer(std::io::stderr));
    let text_layer = (!logging.json_format).then(|| {
        fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .init();
}

async fn run(cli: Cli, config: ConfabConfig) -> anyhow::Result<()> {
    match cli.command {
        Commands::Hub(args) => handle_hub_command(args, config).await,
        Commands::Client(args) => handle_client_command(args, config).await,
        Commands::Agent(args) => handle_agent_command(args, config).await,
        Commands::Config => handle_config_command(&config),
        Commands::Version { detailed } => cmd_version(detailed),
    }
}

fn cmd_version(detailed: bool) -> anyhow::Result<()> {
    if detailed {
        println!("{}", "Confab Version Information".cyan().bold());
        println!("{}", "═".repeat(40).dimmed());
        println!("  {:<15} {}", "Version:".bold(), VERSION);
        println!("  {:<15} {}", "Name:".bold(), NAME);
        println!("  {:<15} Apache-2.0", "License:".bold());
        println!();
        println!("  {}", "Wire protocol:".bold());
        println!("    WebSocket, one JSON frame per message");
        println!("    connect · disconnect · message · ping · pong · command");
        println!();
        println!("  {}", "Build Information:".bold());
        println!("    Rust Edition: 2021");
        #[cfg(debug_assertions)]
        println!("    Build:        Debug");
        #[cfg(not(debug_assertions))]
        println!("    Build:        Release");
    } else {
        println!("confab {}", VERSION);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_hub_flags() {
        let cli = Cli::try_parse_from(["confab", "hub", "--port", "7000", "--console"]).unwrap();
        match cli.command {
            Commands::Hub(args) => {
                assert_eq!(args.port, Some(7000));
                assert!(args.console);
            }
            _ => panic!("expected hub command"),
        }
    }

    #[test]
    fn test_exit_status_for_fatal_errors() {
        let bind = ConfabError::BindFailed {
            addr: "0.0.0.0:8765".to_string(),
            message: "address in use".to_string(),
        };
        let config = ConfabError::ConfigParseError("bad toml".to_string());
        let dropped = ConfabError::ConnectionClosed("peer went away".to_string());

        assert_eq!(exit_status(&bind), 2);
        assert_eq!(exit_status(&config), 2);
        assert_eq!(exit_status(&dropped), 1);
    }

    #[test]
    fn test_parse_agent_speakers() {
        let cli = Cli::try_parse_from([
            "confab",
            "agent",
            "--name",
            "Plato",
            "--speakers",
            "Plato,Euclid,Gabe",
            "--mode",
            "reactive",
        ])
        .unwrap();
        match cli.command {
            Commands::Agent(args) => {
                assert_eq!(args.speakers, vec!["Plato", "Euclid", "Gabe"]);
            }
            _ => panic!("expected agent command"),
        }
    }
}
