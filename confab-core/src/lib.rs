pub mod agent;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod hub;
pub mod models;
pub mod protocol;

pub use agent::{build_agent, http_capabilities, load_instructions, AgentRuntime};
pub use client::{connect, ChatReader, ChatWriter, Identity};
pub use config::{
    get_config_dir, AgentConfig, ClientConfig, ConfabConfig, ConfigLoadError, HubConfig,
    LoggingConfig, TriggerModeConfig,
};
pub use coordinator::{
    ArbitrationMode, ArbitrationRequest, CoordinatorEvent, CoordinatorHandle,
    CoordinatorSettings, DynArbiter, DynResponder, HttpArbiter, HttpCapabilityConfig,
    HttpResponder, Responder, TriggerMode, TurnArbiter, TurnCoordinator, TurnDecision,
    TurnOutcome,
};
pub use error::{retry_async_with_config, CliErrorDisplay, ConfabError, ConfabResult, RetryConfig};
pub use hub::{
    BroadcastRouter, CompositeTranscriptSink, ConnectionRegistry, ConsoleTranscriptSink,
    DeliveryReport, DynTranscriptSink, FileTranscriptSink, Hub, HubServer, NullTranscriptSink,
    PresenceNotifier, Registration, TranscriptEntry, TranscriptFormat, TranscriptSink,
};
pub use models::{
    ConnectionHandle, ConversationWindow, Message, MessageKind, Participant, ParticipantKind,
    Role, WindowEntry, EVENT_TAG, SYSTEM_SENDER_ID,
};
pub use protocol::Frame;
