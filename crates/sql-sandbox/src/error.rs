use std::{fmt, io, path::PathBuf};

use thiserror::Error;

use crate::dsn::DescriptorError;

/// Which connection a [`SandboxError::Connection`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    Admin,
    Ephemeral,
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionRole::Admin => "admin",
            ConnectionRole::Ephemeral => "ephemeral",
        };
        f.write_str(label)
    }
}

/// Errors returned while creating a sandbox.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error(transparent)]
    MalformedDescriptor(#[from] DescriptorError),
    #[error("invalid sandbox configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to connect to {role} database: {source}")]
    Connection {
        role: ConnectionRole,
        #[source]
        source: sqlx::Error,
    },
    #[error("failed to ensure source database is migrated: {0}")]
    Migration(#[from] MigrationError),
    #[error("failed to create template database '{template}': {source}")]
    TemplateCreation {
        template: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("failed to create test database '{name}': {source}")]
    EphemeralCreation {
        name: String,
        #[source]
        source: sqlx::Error,
    },
    #[error(transparent)]
    Teardown(#[from] TeardownError),
}

impl SandboxError {
    /// Whether a connection attempt or statement ran past the configured
    /// connection lifetime.
    pub fn is_timeout(&self) -> bool {
        match self {
            SandboxError::Connection { source, .. }
            | SandboxError::TemplateCreation { source, .. }
            | SandboxError::EphemeralCreation { source, .. } => is_timeout(source),
            _ => false,
        }
    }
}

pub(crate) fn is_timeout(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Io(io) => io.kind() == io::ErrorKind::TimedOut,
        _ => false,
    }
}

/// Errors produced by [`crate::MigrationVerifier`] implementations.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error(transparent)]
    MalformedDescriptor(#[from] DescriptorError),
    #[error("failed to connect to {target}: {source}")]
    Connection {
        target: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("migrations directory not found: {}", .0.display())]
    DirectoryMissing(PathBuf),
    #[error("migration binary '{binary}' not found: {source}")]
    BinaryNotFound {
        binary: String,
        #[source]
        source: which::Error,
    },
    #[error("failed to apply migrations from {}: {source}", .dir.display())]
    ApplyFailed {
        dir: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
    #[error(transparent)]
    Custom(anyhow::Error),
}

/// Non-zero exit (or timeout) of an external migration binary.
#[derive(Debug, Clone, Error)]
#[error("'{command}' {status}; output: {output}")]
pub struct CommandFailure {
    pub command: String,
    pub status: String,
    pub output: String,
}

/// Teardown step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStage {
    ConnectionClose,
    DropDatabase,
    AdminClose,
}

impl fmt::Display for TeardownStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TeardownStage::ConnectionClose => "failed to close test DB connection",
            TeardownStage::DropDatabase => "failed to drop test database",
            TeardownStage::AdminClose => "failed to close admin DB connection",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownFailure {
    pub stage: TeardownStage,
    pub message: String,
}

impl TeardownFailure {
    pub(crate) fn new(stage: TeardownStage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
        }
    }
}

impl fmt::Display for TeardownFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.stage, self.message)
    }
}

/// Every failure collected while closing a sandbox.
///
/// When [`TeardownError::database_dropped`] is `false` the test database still
/// exists on the server and has to be removed by hand.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("errors during cleanup of '{database}': {}", join_failures(.failures))]
pub struct TeardownError {
    pub database: String,
    pub failures: Vec<TeardownFailure>,
}

impl TeardownError {
    pub fn database_dropped(&self) -> bool {
        !self
            .failures
            .iter()
            .any(|failure| failure.stage == TeardownStage::DropDatabase)
    }
}

fn join_failures(failures: &[TeardownFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
