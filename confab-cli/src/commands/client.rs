use anyhow::Result;
use clap::Args;
use colored::Colorize;
use confab_core::protocol::{ChatFrame, Frame};
use confab_core::{
    connect, retry_async_with_config, ConfabConfig, Identity, ParticipantKind, RetryConfig,
};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

use super::ctrl_c;

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Args, Debug)]
pub struct ClientArgs {
    #[arg(short, long, help = "Display name shown to other participants")]
    pub name: String,

    #[arg(long, help = "Unique participant id (random if omitted)")]
    pub id: Option<String>,

    #[arg(long, help = "Advertised host")]
    pub host: Option<String>,

    #[arg(long, help = "Advertised port")]
    pub port: Option<u16>,

    #[arg(short = 'u', long, help = "Hub WebSocket URL")]
    pub hub_url: Option<String>,
}

enum Input {
    Say(String),
    Command(String),
    Quit,
    Nothing,
}

fn parse_input(line: &str) -> Input {
    let line = line.trim();
    match line {
        "" => Input::Nothing,
        "/quit" | "/exit" => Input::Quit,
        _ if line.starts_with('/') => Input::Command(line.to_string()),
        _ => Input::Say(line.to_string()),
    }
}

fn render(chat: &ChatFrame) -> String {
    let time = chat
        .sent_at
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_default();

    let line = match chat.origin {
        Some(ParticipantKind::System) => chat.message.yellow().to_string(),
        Some(ParticipantKind::Agent) => {
            format!("{}: {}", chat.speaker().cyan().bold(), chat.message)
        }
        _ => format!("{}: {}", chat.speaker().green().bold(), chat.message),
    };

    if time.is_empty() {
        line
    } else {
        format!("{} {}", time.dimmed(), line)
    }
}

pub async fn handle_client_command(args: ClientArgs, config: ConfabConfig) -> Result<()> {
    let hub_url = args.hub_url.unwrap_or(config.client.hub_url);
    let id = args
        .id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let host = args.host.or(Some(config.client.host));
    let port = args.port.or(Some(config.client.port));
    let identity = Identity::new(id, args.name, ParticipantKind::Human).with_address(host, port);

    let (mut writer, mut reader) = retry_async_with_config(
        || connect(&hub_url, identity.clone(), SEND_TIMEOUT),
        RetryConfig::default(),
    )
    .await?;

    println!(
        "{} as {} ({}). Type a message and press Enter; /quit to leave.",
        "Connected".green().bold(),
        identity.name.bold(),
        hub_url
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let interrupted = ctrl_c();
    tokio::pin!(interrupted);

    loop {
        tokio::select! {
            _ = &mut interrupted => break,
            line = lines.next_line() => match line? {
                Some(line) => match parse_input(&line) {
                    Input::Say(text) => writer.say(text).await?,
                    Input::Command(command) => {
                        writer.send(&Frame::command(identity.id.clone(), command)).await?
                    }
                    Input::Quit => break,
                    Input::Nothing => {}
                },
                None => break,
            },
            frame = reader.next_frame() => match frame {
                None => {
                    println!("{}", "Hub closed the connection".red());
                    return Ok(());
                }
                Some(Ok(Frame::Message(chat))) => println!("{}", render(&chat)),
                Some(Ok(Frame::Ping)) => writer.pong().await?,
                Some(Ok(other)) => debug!(frame = other.type_name(), "Ignoring frame from hub"),
                Some(Err(e)) if e.is_protocol_error() => e.log(),
                Some(Err(e)) => return Err(e.into()),
            },
        }
    }

    writer.disconnect().await?;
    println!("{}", "Disconnected".dimmed());
    Ok(())
}
