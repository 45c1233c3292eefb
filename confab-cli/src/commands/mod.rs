pub mod agent;
pub mod client;
pub mod config;
pub mod hub;

pub use agent::{handle_agent_command, AgentArgs};
pub use client::{handle_client_command, ClientArgs};
pub use config::handle_config_command;
pub use hub::{handle_hub_command, HubArgs};

/// Resolves when the process receives Ctrl-C.
pub(crate) async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Could not listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}
