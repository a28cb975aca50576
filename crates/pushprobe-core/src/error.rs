use miette::Diagnostic;
use thiserror::Error;

/// Error type for the shared ports and configuration handling
#[derive(Error, Debug, Diagnostic)]
pub enum CoreError {
    /// Command execution failed
    #[error("Command '{command}' failed with exit code {exit_code}")]
    #[diagnostic(code(pushprobe::core::command_failed), help("stderr: {stderr}"))]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {message}")]
    #[diagnostic(
        code(pushprobe::core::invalid_config),
        help("Check the configuration file against the documented schema")
    )]
    InvalidConfig { message: String },
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    pub fn command_failed(
        command: impl Into<String>,
        exit_code: i32,
        stderr: impl Into<String>,
    ) -> Self {
        Self::CommandFailed {
            command: command.into(),
            exit_code,
            stderr: stderr.into(),
        }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }
}
