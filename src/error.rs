//! Error types for task-sync.
//!
//! One crate-wide error enum covers every failure the engine can surface,
//! with constructor helpers and a `category()` accessor that maps each
//! variant onto the engine's error taxonomy (`config`, `dependency`,
//! `identity-drift`, `external`, `cancelled`, `fatal`).

use thiserror::Error;

/// Result type for task-sync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for all task-sync operations
#[derive(Error, Debug)]
pub enum Error {
    /// Container engine binary not found in PATH
    #[error("container engine binary `{binary}` not found in PATH")]
    EngineNotFound {
        /// The binary name that was searched for
        binary: String,
    },

    /// A container engine command returned a non-zero exit code
    #[error("command failed: {command}")]
    CommandFailed {
        /// The command that failed
        command: String,
        /// Exit code returned by the command
        exit_code: i32,
        /// Combined output captured from the command
        output: String,
    },

    /// Step settings could not be decoded into a known configuration
    #[error("invalid step configuration: {message}")]
    InvalidConfig {
        /// What went wrong while decoding
        message: String,
    },

    /// A referenced container does not exist
    #[error("container not found: {container}")]
    ContainerNotFound {
        /// The container name or id that was not found
        container: String,
    },

    /// A referenced image does not exist
    #[error("image not found: {image}")]
    ImageNotFound {
        /// The image reference that was not found
        image: String,
    },

    /// A rubric or task-data file could not be parsed
    #[error("failed to parse {path}: {message}")]
    ParseError {
        /// Path of the offending file
        path: String,
        /// Description of the parse failure
        message: String,
    },

    /// The dependency graph of a task contains a cycle
    #[error("dependency cycle detected: {cycle}")]
    DependencyCycle {
        /// The step ids forming the cycle, rendered as `a -> b -> a`
        cycle: String,
    },

    /// Another engine run already holds the lock for this task
    #[error("task {task_id} is locked by another run")]
    TaskLocked {
        /// The contended task id
        task_id: i64,
    },

    /// A referenced task row does not exist
    #[error("task not found: {task_id}")]
    TaskNotFound {
        /// The missing task id
        task_id: i64,
    },

    /// A referenced step row does not exist
    #[error("step not found: {step_id}")]
    StepNotFound {
        /// The missing step id
        step_id: i64,
    },

    /// The run was cancelled cooperatively
    #[error("run cancelled")]
    Cancelled,

    /// A container did not reach the expected state in time
    #[error("timed out after {timeout_seconds}s waiting for {what}")]
    Timeout {
        /// What the engine was waiting for
        what: String,
        /// Seconds waited before giving up
        timeout_seconds: u64,
    },

    /// IO error occurred during operation
    #[error("io error: {message}")]
    Io {
        /// Error message describing the IO failure
        message: String,
        /// The underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// JSON parsing or serialization error
    #[error("json error: {message}")]
    Json {
        /// Error message describing the JSON failure
        message: String,
        /// The underlying JSON error
        #[source]
        source: serde_json::Error,
    },

    /// Database error
    #[error("database error: {message}")]
    Database {
        /// Error message describing the database failure
        message: String,
        /// The underlying sqlx error
        #[source]
        source: sqlx::Error,
    },

    /// Generic error with custom message
    #[error("{message}")]
    Custom {
        /// Custom error message
        message: String,
    },
}

impl Error {
    /// Create a new command failed error
    pub fn command_failed(command: impl Into<String>, exit_code: i32, output: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            exit_code,
            output: output.into(),
        }
    }

    /// Create a new invalid config error
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a new parse error
    pub fn parse_error(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ParseError {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a new container not found error
    pub fn container_not_found(container: impl Into<String>) -> Self {
        Self::ContainerNotFound {
            container: container.into(),
        }
    }

    /// Create a new image not found error
    pub fn image_not_found(image: impl Into<String>) -> Self {
        Self::ImageNotFound {
            image: image.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout(what: impl Into<String>, timeout_seconds: u64) -> Self {
        Self::Timeout {
            what: what.into(),
            timeout_seconds,
        }
    }

    /// Create a new custom error
    pub fn custom(message: impl Into<String>) -> Self {
        Self::Custom {
            message: message.into(),
        }
    }

    /// Get the taxonomy category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "config",
            Self::CommandFailed { .. }
            | Self::ContainerNotFound { .. }
            | Self::ImageNotFound { .. }
            | Self::Timeout { .. }
            | Self::Io { .. } => "external",
            Self::Cancelled => "cancelled",
            Self::DependencyCycle { .. }
            | Self::Database { .. }
            | Self::TaskLocked { .. }
            | Self::TaskNotFound { .. }
            | Self::StepNotFound { .. }
            | Self::EngineNotFound { .. }
            | Self::ParseError { .. } => "fatal",
            Self::Json { .. } | Self::Custom { .. } => "external",
        }
    }

    /// Whether the engine must abort the whole run instead of recording a
    /// per-step failure
    pub fn is_fatal(&self) -> bool {
        self.category() == "fatal"
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::Database {
            message: err.to_string(),
            source: err,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(Error::invalid_config("bad").category(), "config");
        assert_eq!(Error::command_failed("docker run", 1, "").category(), "external");
        assert_eq!(Error::Cancelled.category(), "cancelled");
        assert_eq!(
            Error::DependencyCycle {
                cycle: "1 -> 2 -> 1".into()
            }
            .category(),
            "fatal"
        );
        assert_eq!(Error::parse_error("rubric.md", "bad header").category(), "fatal");
        assert_eq!(Error::TaskLocked { task_id: 7 }.category(), "fatal");
    }

    #[test]
    fn test_fatal_errors_abort() {
        assert!(Error::TaskNotFound { task_id: 1 }.is_fatal());
        assert!(!Error::command_failed("docker exec", 2, "boom").is_fatal());
        assert!(!Error::Cancelled.is_fatal());
    }

    #[test]
    fn test_command_failed_constructor() {
        let err = Error::command_failed("docker build -t app:1 .", 1, "no Dockerfile");
        match err {
            Error::CommandFailed {
                command,
                exit_code,
                output,
            } => {
                assert_eq!(command, "docker build -t app:1 .");
                assert_eq!(exit_code, 1);
                assert_eq!(output, "no Dockerfile");
            }
            _ => panic!("wrong error type"),
        }
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        match err {
            Error::Io { message, .. } => assert!(message.contains("file not found")),
            _ => panic!("wrong error type"),
        }
    }
}
