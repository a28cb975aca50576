use miette::Diagnostic;
use thiserror::Error;

/// Agent-side error type
#[derive(Error, Debug, Diagnostic)]
pub enum AgentError {
    /// Startup guard failed; fatal for this agent
    #[error("Agent boot failure: {message}")]
    #[diagnostic(
        code(pushprobe::agent::boot_failure),
        help("Check metadata discovery, the certificate bundle, and the emulator toolchain")
    )]
    BootFailure { message: String },

    /// The call exceeded its own deadline; never retried
    #[error("{operation}: deadline exceeded")]
    #[diagnostic(
        code(pushprobe::agent::deadline_exceeded),
        help("The controller did not answer within the configured per-call timeout")
    )]
    DeadlineExceeded { operation: String },

    /// All retry attempts failed
    #[error("{operation}: maximum {operation} retries exceeded")]
    #[diagnostic(
        code(pushprobe::agent::max_retries),
        help("The controller stayed unreachable across the whole retry budget")
    )]
    MaxRetries { operation: String },

    /// Transport or status failure on the control channel
    #[error("RPC failure: {message}")]
    #[diagnostic(code(pushprobe::agent::rpc_failure))]
    Rpc { message: String },

    /// The device never produced a token within the retry budget
    #[error("timed out on token generation")]
    #[diagnostic(
        code(pushprobe::agent::token_timeout),
        help("Verify the target app is installed and can reach the push service")
    )]
    TokenTimeout,

    /// The device clock reading could not be parsed
    #[error("time returned from device formatted incorrectly: {raw}")]
    #[diagnostic(code(pushprobe::agent::device_time))]
    DeviceTime { raw: String },

    /// Metadata discovery failed
    #[error("Metadata discovery failed: {message}")]
    #[diagnostic(
        code(pushprobe::agent::metadata),
        help("Confirm the controller published the probeData project-metadata item")
    )]
    Metadata { message: String },

    /// Access-token refresh failed
    #[error("Auth refresh failed: {message}")]
    #[diagnostic(code(pushprobe::agent::auth))]
    Auth { message: String },

    /// Command port error
    #[error(transparent)]
    #[diagnostic(transparent)]
    CoreError(#[from] pushprobe_core::CoreError),
}

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

impl AgentError {
    pub fn boot_failure(message: impl Into<String>) -> Self {
        Self::BootFailure {
            message: message.into(),
        }
    }

    pub fn deadline_exceeded(operation: impl Into<String>) -> Self {
        Self::DeadlineExceeded {
            operation: operation.into(),
        }
    }

    pub fn max_retries(operation: impl Into<String>) -> Self {
        Self::MaxRetries {
            operation: operation.into(),
        }
    }

    pub fn rpc(message: impl Into<String>) -> Self {
        Self::Rpc {
            message: message.into(),
        }
    }

    pub fn device_time(raw: impl Into<String>) -> Self {
        Self::DeviceTime { raw: raw.into() }
    }

    pub fn metadata(message: impl Into<String>) -> Self {
        Self::Metadata {
            message: message.into(),
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }
}
