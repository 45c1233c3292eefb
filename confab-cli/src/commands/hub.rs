use anyhow::Result;
use clap::Args;
use colored::Colorize;
use confab_core::{
    CompositeTranscriptSink, ConfabConfig, ConfabError, ConsoleTranscriptSink, DynTranscriptSink,
    FileTranscriptSink, HubConfig, HubServer, NullTranscriptSink, TranscriptFormat,
};
use std::path::PathBuf;
use std::sync::Arc;

use super::ctrl_c;

#[derive(Args, Debug)]
pub struct HubArgs {
    #[arg(short, long, help = "Address to bind (default 127.0.0.1)")]
    pub bind: Option<String>,

    #[arg(short, long, help = "Port to listen on (default 9999)")]
    pub port: Option<u16>,

    #[arg(short, long, help = "Echo every routed message to stdout")]
    pub console: bool,

    #[arg(short, long, help = "Append every routed message to this file")]
    pub transcript: Option<PathBuf>,

    #[arg(long, help = "Transcript format: json or plain")]
    pub transcript_format: Option<String>,
}

impl HubArgs {
    fn apply(self, mut config: HubConfig) -> Result<HubConfig> {
        if let Some(bind) = self.bind {
            config.bind_address = bind;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if self.console {
            config.console = true;
        }
        if let Some(path) = self.transcript {
            config.transcript_path = path.to_string_lossy().into_owned();
        }
        if let Some(format) = self.transcript_format {
            config.transcript_format = parse_format(&format)?;
        }
        Ok(config)
    }
}

fn parse_format(value: &str) -> Result<TranscriptFormat> {
    match value.to_lowercase().as_str() {
        "json" => Ok(TranscriptFormat::Json),
        "plain" | "text" => Ok(TranscriptFormat::Plain),
        other => Err(ConfabError::InvalidConfigValue {
            key: "hub.transcript_format".to_string(),
            message: format!("Unknown format '{}'; use json or plain", other),
        }
        .into()),
    }
}

async fn build_sink(config: &HubConfig) -> Result<DynTranscriptSink> {
    let mut sinks: Vec<DynTranscriptSink> = Vec::new();

    if config.console {
        sinks.push(Arc::new(ConsoleTranscriptSink));
    }
    if let Some(path) = config.transcript_path() {
        sinks.push(Arc::new(
            FileTranscriptSink::open(&path, config.transcript_format).await?,
        ));
    }

    Ok(match sinks.len() {
        0 => Arc::new(NullTranscriptSink),
        1 => sinks.remove(0),
        _ => Arc::new(CompositeTranscriptSink::new(sinks)),
    })
}

pub async fn handle_hub_command(args: HubArgs, config: ConfabConfig) -> Result<()> {
    let hub_config = args.apply(config.hub)?;
    let sink = build_sink(&hub_config).await?;
    let server = HubServer::bind(&hub_config, sink).await?;
    let addr = server.local_addr()?;

    println!("{}", "Confab hub".cyan().bold());
    println!("  {} Listening on {}", "→".blue(), format!("ws://{}", addr).bold());
    if hub_config.console {
        println!("  {} Console echo enabled", "→".blue());
    }
    if let Some(path) = hub_config.transcript_path() {
        println!("  {} Transcript: {}", "→".blue(), path.display());
    }
    println!("  {} Press Ctrl-C to stop", "→".blue());
    println!();

    server.serve_with_shutdown(ctrl_c()).await?;

    println!("{}", "Hub stopped".dimmed());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let args = HubArgs {
            bind: Some("0.0.0.0".to_string()),
            port: Some(7000),
            console: true,
            transcript: Some(PathBuf::from("chat.log")),
            transcript_format: Some("plain".to_string()),
        };

        let config = args.apply(HubConfig::default()).unwrap();
        assert_eq!(config.bind_addr(), "0.0.0.0:7000");
        assert!(config.console);
        assert_eq!(config.transcript_format, TranscriptFormat::Plain);
    }

    #[test]
    fn test_unknown_format_rejected() {
        assert!(parse_format("xml").is_err());
        assert_eq!(parse_format("JSON").unwrap(), TranscriptFormat::Json);
    }

    #[tokio::test]
    async fn test_sink_selection() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = HubConfig::default();
        config.console = true;
        config.transcript_path = dir.path().join("t.log").to_string_lossy().into_owned();

        assert!(build_sink(&config).await.is_ok());
        assert!(dir.path().join("t.log").exists());
    }
}
