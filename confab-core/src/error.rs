//! Error types for the Confab core library.
//!
//! Every fallible operation in the hub, the client connection and the turn
//! coordinator returns a [`ConfabError`]. Each variant carries a stable code
//! so log lines can be grepped and correlated across processes.
//!
//! # Error Codes Reference
//!
//! | Code Range | Category | Description |
//! |------------|----------|-------------|
//! | E1001-E1099 | Protocol | Malformed frames, unknown types, frames before registration |
//! | E2001-E2099 | Config | Environment, config file, and validation errors |
//! | E3001-E3099 | Transport | Bind, connect, send, and liveness errors |
//! | E4001-E4099 | Capability | Responder and turn arbiter failures |
//! | E9001-E9099 | General | Internal, IO, and serialization errors |

use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

/// Configuration for retry behavior with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first one)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (e.g., 2.0 for doubling)
    pub backoff_multiplier: f64,
    /// Whether to add jitter to prevent thundering herd
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Retry policy for an agent re-establishing its hub connection: five
    /// attempts from a five second base delay.
    pub fn for_agent_reconnection() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 1.5,
            jitter: true,
        }
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay =
            self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        let final_delay = if self.jitter {
            // up to 25% extra
            let jitter_factor = 1.0 + (rand_jitter() * 0.25);
            capped_delay * jitter_factor
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay as u64)
    }
}

/// Cheap jitter source based on the current timestamp, in `0.0..1.0`.
fn rand_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}

/// The main error type for the Confab core library.
#[derive(Debug, Error)]
pub enum ConfabError {
    // ========================================================================
    // Protocol Errors (E1001-E1099)
    // ========================================================================
    /// Frame is not valid JSON or is missing required fields
    #[error("[E1001] Malformed frame: {0}")]
    MalformedFrame(String),

    /// Frame carries a `type` the protocol does not know
    #[error("[E1002] Unknown frame type: {0}")]
    UnknownFrameType(String),

    /// Frame other than `connect` received before registration
    #[error("[E1003] Frame '{0}' received before registration")]
    NotRegistered(String),

    /// Registration request rejected
    #[error("[E1004] Invalid registration: {0}")]
    InvalidRegistration(String),

    // ========================================================================
    // Configuration Errors (E2001-E2099)
    // ========================================================================
    /// Required environment variable is missing
    #[error("[E2001] Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// Configuration file parse error
    #[error("[E2002] Failed to parse configuration: {0}")]
    ConfigParseError(String),

    /// Invalid configuration value
    #[error("[E2003] Invalid configuration value for '{key}': {message}")]
    InvalidConfigValue { key: String, message: String },

    /// Configuration error (generic)
    #[error("[E2004] Configuration error: {0}")]
    Config(String),

    // ========================================================================
    // Transport Errors (E3001-E3099)
    // ========================================================================
    /// Hub could not bind its listening socket
    #[error("[E3001] Failed to bind {addr}: {message}")]
    BindFailed { addr: String, message: String },

    /// Client could not reach the hub
    #[error("[E3002] Failed to connect to {url}: {message}")]
    ConnectionFailed { url: String, message: String },

    /// Writing to a peer failed
    #[error("[E3003] Send failed: {0}")]
    SendFailed(String),

    /// Writing to a peer did not finish in time
    #[error("[E3004] Send timed out after {0:?}")]
    SendTimeout(Duration),

    /// Peer closed the connection
    #[error("[E3005] Connection closed: {0}")]
    ConnectionClosed(String),

    /// Peer sent nothing within the idle limit
    #[error("[E3006] Peer '{0}' stopped responding")]
    PeerUnresponsive(String),

    // ========================================================================
    // Capability Errors (E4001-E4099)
    // ========================================================================
    /// Responder failed to produce a reply
    #[error("[E4001] Generation failed: {0}")]
    GenerationError(String),

    /// Turn arbiter failed to produce a decision
    #[error("[E4002] Arbitration failed: {0}")]
    ArbitrationError(String),

    /// Capability call exceeded its time budget
    #[error("[E4003] {capability} timed out after {timeout:?}")]
    CapabilityTimeout {
        capability: String,
        timeout: Duration,
    },

    /// Capability endpoint unreachable or overloaded
    #[error("[E4004] Capability unavailable: {0}")]
    CapabilityUnavailable(String),

    // ========================================================================
    // General Errors (E9001-E9099)
    // ========================================================================
    /// Internal error (catch-all for unexpected conditions)
    #[error("[E9001] Internal error: {0}")]
    Internal(String),

    /// IO error
    #[error("[E9002] IO error: {0}")]
    IoError(String),

    /// Serialization/deserialization error
    #[error("[E9003] Serialization error: {0}")]
    SerializationError(String),
}

/// Result type alias for Confab operations.
pub type ConfabResult<T> = Result<T, ConfabError>;

// ============================================================================
// From trait implementations for seamless error propagation
// ============================================================================

impl From<serde_json::Error> for ConfabError {
    fn from(err: serde_json::Error) -> Self {
        ConfabError::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for ConfabError {
    fn from(err: std::io::Error) -> Self {
        ConfabError::IoError(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ConfabError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                ConfabError::ConnectionClosed(err.to_string())
            }
            WsError::Io(e) => ConfabError::SendFailed(e.to_string()),
            other => ConfabError::SendFailed(other.to_string()),
        }
    }
}

impl From<config::ConfigError> for ConfabError {
    fn from(err: config::ConfigError) -> Self {
        match err {
            config::ConfigError::NotFound(key) => ConfabError::InvalidConfigValue {
                key,
                message: "Key not found".to_string(),
            },
            config::ConfigError::FileParse { uri, cause } => ConfabError::ConfigParseError(
                format!("Failed to parse {}: {}", uri.unwrap_or_default(), cause),
            ),
            config::ConfigError::Type {
                origin,
                unexpected,
                expected,
                key,
            } => ConfabError::InvalidConfigValue {
                key: key.unwrap_or_else(|| origin.map(|o| o.to_string()).unwrap_or_default()),
                message: format!("Expected {}, got {}", expected, unexpected),
            },
            _ => ConfabError::ConfigParseError(err.to_string()),
        }
    }
}

// ============================================================================
// Error categorization helpers
// ============================================================================

impl ConfabError {
    /// Returns true for errors that only cost the offending frame.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            ConfabError::MalformedFrame(_)
                | ConfabError::UnknownFrameType(_)
                | ConfabError::NotRegistered(_)
                | ConfabError::InvalidRegistration(_)
        )
    }

    /// Returns true if this error is related to configuration.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            ConfabError::MissingEnvVar(_)
                | ConfabError::ConfigParseError(_)
                | ConfabError::InvalidConfigValue { .. }
                | ConfabError::Config(_)
        )
    }

    /// Returns true for errors that end one connection.
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            ConfabError::BindFailed { .. }
                | ConfabError::ConnectionFailed { .. }
                | ConfabError::SendFailed(_)
                | ConfabError::SendTimeout(_)
                | ConfabError::ConnectionClosed(_)
                | ConfabError::PeerUnresponsive(_)
        )
    }

    /// Returns true for Responder/Arbiter failures.
    pub fn is_capability_error(&self) -> bool {
        matches!(
            self,
            ConfabError::GenerationError(_)
                | ConfabError::ArbitrationError(_)
                | ConfabError::CapabilityTimeout { .. }
                | ConfabError::CapabilityUnavailable(_)
        )
    }

    /// Returns true if this error is transient and the operation might succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConfabError::ConnectionFailed { .. }
                | ConfabError::ConnectionClosed(_)
                | ConfabError::SendTimeout(_)
                | ConfabError::PeerUnresponsive(_)
                | ConfabError::CapabilityTimeout { .. }
                | ConfabError::CapabilityUnavailable(_)
        )
    }

    /// Returns true if the process should exit on this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConfabError::BindFailed { .. }) || self.is_config_error()
    }

    /// Returns an error code suitable for logging or external reporting.
    pub fn error_code(&self) -> &'static str {
        match self {
            ConfabError::MalformedFrame(_) => "E1001",
            ConfabError::UnknownFrameType(_) => "E1002",
            ConfabError::NotRegistered(_) => "E1003",
            ConfabError::InvalidRegistration(_) => "E1004",
            ConfabError::MissingEnvVar(_) => "E2001",
            ConfabError::ConfigParseError(_) => "E2002",
            ConfabError::InvalidConfigValue { .. } => "E2003",
            ConfabError::Config(_) => "E2004",
            ConfabError::BindFailed { .. } => "E3001",
            ConfabError::ConnectionFailed { .. } => "E3002",
            ConfabError::SendFailed(_) => "E3003",
            ConfabError::SendTimeout(_) => "E3004",
            ConfabError::ConnectionClosed(_) => "E3005",
            ConfabError::PeerUnresponsive(_) => "E3006",
            ConfabError::GenerationError(_) => "E4001",
            ConfabError::ArbitrationError(_) => "E4002",
            ConfabError::CapabilityTimeout { .. } => "E4003",
            ConfabError::CapabilityUnavailable(_) => "E4004",
            ConfabError::Internal(_) => "E9001",
            ConfabError::IoError(_) => "E9002",
            ConfabError::SerializationError(_) => "E9003",
        }
    }

    /// Returns a user-friendly suggestion for how to resolve this error.
    pub fn user_suggestion(&self) -> Option<&'static str> {
        match self {
            ConfabError::BindFailed { .. } => {
                Some("Another process may own the port. Pick another with --port")
            }
            ConfabError::ConnectionFailed { .. } => {
                Some("Check that 'confab hub' is running and the hub URL is correct")
            }
            ConfabError::MissingEnvVar(_) => {
                Some("Create a .env file or set the environment variable")
            }
            ConfabError::ConfigParseError(_) => {
                Some("Run 'confab config' to print the effective configuration")
            }
            ConfabError::CapabilityUnavailable(_) => {
                Some("Check the responder/arbiter endpoint URLs and API key")
            }
            _ => None,
        }
    }

    /// Log this error with appropriate severity level.
    pub fn log(&self) {
        let code = self.error_code();
        let suggestion = self.user_suggestion();

        if self.is_transient() || self.is_protocol_error() || self.is_capability_error() {
            warn!(
                error_code = %code,
                suggestion = suggestion,
                "Recoverable error: {}",
                self
            );
        } else {
            error!(
                error_code = %code,
                suggestion = suggestion,
                "Error occurred: {}",
                self
            );
        }
    }
}

// ============================================================================
// Retry utilities
// ============================================================================

/// Execute an async operation with custom retry configuration.
///
/// Non-transient errors are returned immediately.
pub async fn retry_async_with_config<F, Fut, T>(
    operation: F,
    config: RetryConfig,
) -> ConfabResult<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = ConfabResult<T>>,
{
    let mut last_error = None;

    for attempt in 0..config.max_attempts {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    info!(
                        "Operation succeeded on attempt {} after {} retries",
                        attempt + 1,
                        attempt
                    );
                }
                return Ok(result);
            }
            Err(e) => {
                if !e.is_transient() || attempt == config.max_attempts - 1 {
                    e.log();
                    return Err(e);
                }

                let delay = config.delay_for_attempt(attempt);
                warn!(
                    "Attempt {} failed ({}), retrying in {:?}",
                    attempt + 1,
                    e,
                    delay
                );

                tokio::time::sleep(delay).await;
                last_error = Some(e);
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| ConfabError::Internal("Retry loop exhausted without error".to_string())))
}

// ============================================================================
// User-friendly error formatting for CLI
// ============================================================================

/// Format an error for CLI display with suggestions.
pub struct CliErrorDisplay<'a> {
    error: &'a ConfabError,
}

impl<'a> CliErrorDisplay<'a> {
    pub fn new(error: &'a ConfabError) -> Self {
        Self { error }
    }
}

impl<'a> fmt::Display for CliErrorDisplay<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // message already carries the code
        writeln!(f, "{}", self.error)?;

        if let Some(suggestion) = self.error.user_suggestion() {
            writeln!(f)?;
            writeln!(f, "  Suggestion: {}", suggestion)?;
        }

        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
