//! Strategies that make sure the source database schema is current before a
//! template is cloned from it.

use std::{
    fmt,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use futures::future::BoxFuture;
use sqlx::{migrate::Migrator, Connection, PgConnection};
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::{
    config::DEFAULT_CONNECTION_LIFETIME,
    dsn,
    error::{CommandFailure, MigrationError},
    template::within,
};

/// Brings (or checks) the database behind a descriptor to the expected
/// migration state. Calling it on an up to date database must be a no-op.
#[async_trait]
pub trait MigrationVerifier: Send + Sync {
    async fn ensure_migrated(&self, url: &str) -> Result<(), MigrationError>;
}

#[async_trait]
impl<V> MigrationVerifier for Arc<V>
where
    V: MigrationVerifier + ?Sized,
{
    async fn ensure_migrated(&self, url: &str) -> Result<(), MigrationError> {
        (**self).ensure_migrated(url).await
    }
}

#[async_trait]
impl<V> MigrationVerifier for Box<V>
where
    V: MigrationVerifier + ?Sized,
{
    async fn ensure_migrated(&self, url: &str) -> Result<(), MigrationError> {
        (**self).ensure_migrated(url).await
    }
}

/// Pings the database and looks for a migration tracking table. A missing
/// table is only reported as a warning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicVerifier {
    schema: String,
    tracking_table: String,
    timeout: Duration,
}

impl Default for BasicVerifier {
    fn default() -> Self {
        Self {
            schema: "public".into(),
            tracking_table: "_sqlx_migrations".into(),
            timeout: DEFAULT_CONNECTION_LIFETIME,
        }
    }
}

impl BasicVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracking table written by another migration tool, e.g.
    /// `schema_migrations`.
    pub fn with_tracking_table(mut self, table: impl Into<String>) -> Self {
        self.tracking_table = table.into();
        self
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    /// Bound for connecting and for each query.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl MigrationVerifier for BasicVerifier {
    #[instrument(skip_all, fields(table = %self.tracking_table))]
    async fn ensure_migrated(&self, url: &str) -> Result<(), MigrationError> {
        let mut conn = connect(url, self.timeout).await?;
        within(self.timeout, "ping", conn.ping())
            .await
            .map_err(|source| MigrationError::Connection {
                target: dsn::redact(url),
                source,
            })?;

        let exists = within(
            self.timeout,
            "tracking table lookup",
            sqlx::query_scalar::<_, bool>(
                "SELECT EXISTS(SELECT 1 FROM information_schema.tables \
                 WHERE table_schema = $1 AND table_name = $2)",
            )
            .bind(&self.schema)
            .bind(&self.tracking_table)
            .fetch_one(&mut conn),
        )
        .await;

        match exists {
            Ok(true) => debug!(schema = %self.schema, "migration tracking table present"),
            Ok(false) => warn!(
                schema = %self.schema,
                "migration tracking table not found; the source database may not be migrated"
            ),
            Err(err) => warn!(error = %err, "failed to check for migration tracking table"),
        }

        close_quietly(conn).await;
        Ok(())
    }
}

/// Applies `<version>_<description>.up.sql` files from a directory with the
/// sqlx migrator. Already applied versions are skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMigrator {
    dir: PathBuf,
    connect_timeout: Duration,
}

impl FileMigrator {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            connect_timeout: DEFAULT_CONNECTION_LIFETIME,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Bounds the connection attempt only; running migrations is not timed.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl MigrationVerifier for FileMigrator {
    #[instrument(skip_all, fields(dir = %self.dir.display()))]
    async fn ensure_migrated(&self, url: &str) -> Result<(), MigrationError> {
        let dir = resolve_dir(&self.dir).await?;
        let migrator = Migrator::new(dir.as_path())
            .await
            .map_err(|err| apply_failed(&dir, err))?;

        let mut conn = connect(url, self.connect_timeout).await?;
        let result = migrator.run_direct(&mut conn).await;
        close_quietly(conn).await;
        result.map_err(|err| apply_failed(&dir, err))?;

        info!(
            dir = %dir.display(),
            known = migrator.iter().count(),
            "source database migrations up to date"
        );
        Ok(())
    }
}

/// Runs an external migration binary as
/// `<binary> -dir <dir> <driver> <url> up`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandMigrator {
    binary: String,
    dir: PathBuf,
    driver: String,
    timeout: Option<Duration>,
}

impl CommandMigrator {
    /// `goose` against `dir` with the `postgres` driver and no timeout.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: "goose".into(),
            dir: dir.into(),
            driver: "postgres".into(),
            timeout: None,
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_driver(mut self, driver: impl Into<String>) -> Self {
        self.driver = driver.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl MigrationVerifier for CommandMigrator {
    #[instrument(skip_all, fields(binary = %self.binary, dir = %self.dir.display()))]
    async fn ensure_migrated(&self, url: &str) -> Result<(), MigrationError> {
        let binary = which::which(&self.binary).map_err(|source| MigrationError::BinaryNotFound {
            binary: self.binary.clone(),
            source,
        })?;
        let dir = resolve_dir(&self.dir).await?;

        let rendered = format!(
            "{} -dir {} {} {} up",
            self.binary,
            dir.display(),
            self.driver,
            dsn::redact(url)
        );

        let mut command = Command::new(&binary);
        command
            .arg("-dir")
            .arg(&dir)
            .arg(&self.driver)
            .arg(url)
            .arg("up")
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, command.output()).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(timeout = ?limit, "migration command timed out, terminating process");
                    return Err(apply_failed(
                        &dir,
                        CommandFailure {
                            command: rendered,
                            status: format!("timed out after {limit:?}"),
                            output: String::new(),
                        },
                    ));
                }
            },
            None => command.output().await,
        }
        .map_err(|err| apply_failed(&dir, err))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            return Err(apply_failed(
                &dir,
                CommandFailure {
                    command: rendered,
                    status: output.status.to_string(),
                    output: combined.trim().to_string(),
                },
            ));
        }

        debug!(output = %combined.trim(), "migration command finished");
        info!(dir = %dir.display(), "migrations applied with external runner");
        Ok(())
    }
}

/// Delegates to a caller supplied async callback.
///
/// ```rust
/// use futures::FutureExt;
/// use sql_sandbox::FnVerifier;
///
/// let verifier = FnVerifier::new(|url: String| {
///     async move {
///         anyhow::ensure!(!url.is_empty(), "empty descriptor");
///         Ok(())
///     }
///     .boxed()
/// });
/// # let _ = verifier;
/// ```
pub struct FnVerifier<F> {
    callback: F,
}

impl<F> FnVerifier<F>
where
    F: Fn(String) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> fmt::Debug for FnVerifier<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnVerifier").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F> MigrationVerifier for FnVerifier<F>
where
    F: Fn(String) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync,
{
    async fn ensure_migrated(&self, url: &str) -> Result<(), MigrationError> {
        (self.callback)(url.to_string())
            .await
            .map_err(MigrationError::Custom)
    }
}

async fn connect(url: &str, limit: Duration) -> Result<PgConnection, MigrationError> {
    let options = dsn::connect_options(url)?;
    within(limit, "connecting", PgConnection::connect_with(&options))
        .await
        .map_err(|source| MigrationError::Connection {
            target: dsn::redact(url),
            source,
        })
}

async fn close_quietly(conn: PgConnection) {
    if let Err(err) = conn.close().await {
        debug!(error = %err, "failed to close verifier connection");
    }
}

async fn resolve_dir(dir: &Path) -> Result<PathBuf, MigrationError> {
    let resolved = tokio::fs::canonicalize(dir)
        .await
        .map_err(|_| MigrationError::DirectoryMissing(dir.to_path_buf()))?;
    let metadata = tokio::fs::metadata(&resolved)
        .await
        .map_err(|_| MigrationError::DirectoryMissing(dir.to_path_buf()))?;
    if !metadata.is_dir() {
        return Err(MigrationError::DirectoryMissing(dir.to_path_buf()));
    }
    Ok(resolved)
}

fn apply_failed<E>(dir: &Path, err: E) -> MigrationError
where
    E: std::error::Error + Send + Sync + 'static,
{
    MigrationError::ApplyFailed {
        dir: dir.to_path_buf(),
        source: Box::new(err),
    }
}
