use miette::Diagnostic;
use thiserror::Error;

/// Controller-side error type
#[derive(Error, Debug, Diagnostic)]
pub enum ControllerError {
    /// Control-plane bootstrap failed; fatal for the whole fleet
    #[error("Controller boot failure: {message}")]
    #[diagnostic(
        code(pushprobe::controller::boot_failure),
        help("Check TLS material, the bind address, and metadata publication permissions")
    )]
    BootFailure { message: String },

    /// The cloud zone listing or a zone descriptor query failed
    #[error("Zone enumeration failed: {message}")]
    #[diagnostic(
        code(pushprobe::controller::enumeration_failed),
        help("Verify the cloud CLI is installed and authenticated")
    )]
    EnumerationFailed { message: String },

    /// No zone satisfies the hardware requirements
    #[error("No compatible zones available")]
    #[diagnostic(
        code(pushprobe::controller::no_zones_available),
        help("Relax the minimum hardware requirements or widen the candidate regions")
    )]
    NoZonesAvailable,

    /// Instance creation failed; the VM stays in its previous state
    #[error("Could not start VM in zone {zone}: {message}")]
    #[diagnostic(
        code(pushprobe::controller::start_failure),
        help("Check instance quota and image availability in the zone")
    )]
    StartFailure { zone: String, message: String },

    /// An RPC arrived from a source with no provisioned VM
    #[error("Unknown agent: {agent}")]
    #[diagnostic(
        code(pushprobe::controller::unknown_agent),
        help("The source of a Register or Ping call must match a provisioned zone name")
    )]
    UnknownAgent { agent: String },

    /// Invalid configuration
    #[error("Invalid controller configuration: {message}")]
    #[diagnostic(code(pushprobe::controller::invalid_config), help("{suggestion}"))]
    InvalidConfig { message: String, suggestion: String },

    /// Command port error
    #[error(transparent)]
    #[diagnostic(transparent)]
    CoreError(#[from] pushprobe_core::CoreError),
}

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, ControllerError>;

impl ControllerError {
    pub fn boot_failure(message: impl Into<String>) -> Self {
        Self::BootFailure {
            message: message.into(),
        }
    }

    pub fn enumeration_failed(message: impl Into<String>) -> Self {
        Self::EnumerationFailed {
            message: message.into(),
        }
    }

    pub fn start_failure(zone: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StartFailure {
            zone: zone.into(),
            message: message.into(),
        }
    }

    pub fn unknown_agent(agent: impl Into<String>) -> Self {
        Self::UnknownAgent {
            agent: agent.into(),
        }
    }

    pub fn invalid_config(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }
}
