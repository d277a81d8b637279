use std::{fmt, time::Duration};

use sqlx::{
    postgres::{PgPool, PgPoolOptions},
    PgConnection,
};
use tokio::{runtime::Handle, sync::Mutex};
use tracing::{debug, info, instrument, warn};

use crate::{
    config::{SandboxConfig, FALLBACK_SOURCE_DATABASE},
    dsn,
    error::{is_timeout, ConnectionRole, SandboxError, TeardownError, TeardownFailure, TeardownStage},
    migration::{BasicVerifier, MigrationVerifier},
    naming,
    template::{self, ensure_template, within},
    Result,
};

/// A uniquely named PostgreSQL database cloned from a template of the source
/// database, together with a connection pool pointing at it.
///
/// Call [`Sandbox::close`] when the test is done. A sandbox that is dropped
/// without being closed logs a warning and schedules a best-effort cleanup on
/// the current tokio runtime; if that cleanup cannot run the database is left
/// behind. The same is true when `close` returns an error whose
/// [`TeardownError::database_dropped`] is `false`.
pub struct Sandbox {
    pool: PgPool,
    database_name: String,
    ephemeral_url: String,
    config: SandboxConfig,
    teardown: Mutex<TeardownState>,
}

struct TeardownState {
    admin: Option<PgPool>,
    outcome: Option<std::result::Result<(), TeardownError>>,
}

impl Sandbox {
    /// Creates a sandbox after a basic migration check of the source.
    pub async fn new(source_url: &str, config: SandboxConfig) -> Result<Self> {
        let config = config.normalized();
        let verifier = BasicVerifier::default().with_timeout(config.connection_lifetime);
        Self::with_verifier(source_url, config, &verifier).await
    }

    #[instrument(skip_all, fields(source = %dsn::redact(source_url)))]
    pub async fn with_verifier<V>(
        source_url: &str,
        config: SandboxConfig,
        verifier: &V,
    ) -> Result<Self>
    where
        V: MigrationVerifier + ?Sized,
    {
        let mut config = config.normalized();
        config.validate()?;
        config.source_url = source_url.to_string();
        dsn::connect_options(source_url)?;

        verifier.ensure_migrated(source_url).await?;

        let source_database = dsn::extract_database_name(source_url).unwrap_or_else(|| {
            debug!(
                fallback = FALLBACK_SOURCE_DATABASE,
                "source descriptor names no database"
            );
            FALLBACK_SOURCE_DATABASE.to_string()
        });

        let admin_url = dsn::replace_database_name(source_url, &config.maintenance_database);
        let admin = open_pool(&admin_url, 1, &config, ConnectionRole::Admin).await?;

        match provision(&admin, &source_database, &config).await {
            Ok((database_name, ephemeral_url, pool)) => {
                info!(database = %database_name, template = %config.template_name, "sandbox ready");
                Ok(Self::assemble(pool, admin, database_name, ephemeral_url, config))
            }
            Err(err) => {
                if tokio::time::timeout(config.connection_lifetime, admin.close())
                    .await
                    .is_err()
                {
                    warn!("admin pool did not close after a failed setup");
                }
                Err(err)
            }
        }
    }

    fn assemble(
        pool: PgPool,
        admin: PgPool,
        database_name: String,
        ephemeral_url: String,
        config: SandboxConfig,
    ) -> Self {
        Self {
            pool,
            database_name,
            ephemeral_url,
            config,
            teardown: Mutex::new(TeardownState {
                admin: Some(admin),
                outcome: None,
            }),
        }
    }

    /// Pool connected to the test database.
    pub fn connection(&self) -> &PgPool {
        &self.pool
    }

    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    /// Source descriptor rewritten to target the test database.
    pub fn ephemeral_url(&self) -> &str {
        &self.ephemeral_url
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Closes the pool, disconnects remaining sessions, drops the test
    /// database and releases the admin connection.
    ///
    /// Only the first call does any work. Later and concurrent calls wait for
    /// it and return the same result.
    #[instrument(skip(self), fields(database = %self.database_name))]
    pub async fn close(&self) -> std::result::Result<(), TeardownError> {
        let mut state = self.teardown.lock().await;
        if let Some(outcome) = &state.outcome {
            return outcome.clone();
        }

        let admin = state.admin.take();
        let outcome = teardown_resources(
            &self.pool,
            admin,
            &self.database_name,
            self.config.connection_lifetime,
        )
        .await;
        if let Err(err) = &outcome {
            warn!(error = %err, dropped = err.database_dropped(), "sandbox cleanup incomplete");
        }
        state.outcome = Some(outcome.clone());
        outcome
    }
}

impl fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sandbox")
            .field("database_name", &self.database_name)
            .field("ephemeral_url", &dsn::redact(&self.ephemeral_url))
            .field("template_name", &self.config.template_name)
            .finish_non_exhaustive()
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        let state = self.teardown.get_mut();
        if state.outcome.is_some() {
            return;
        }
        let Some(admin) = state.admin.take() else {
            return;
        };

        let database = self.database_name.clone();
        match Handle::try_current() {
            Ok(handle) => {
                warn!(database = %database, "sandbox dropped without close; scheduling cleanup");
                let pool = self.pool.clone();
                let limit = self.config.connection_lifetime;
                handle.spawn(async move {
                    if let Err(err) = teardown_resources(&pool, Some(admin), &database, limit).await
                    {
                        warn!(error = %err, "background sandbox cleanup failed");
                    }
                });
            }
            Err(_) => {
                warn!(
                    database = %database,
                    "sandbox dropped without close outside a tokio runtime; test database leaked"
                );
            }
        }
    }
}

async fn provision(
    admin: &PgPool,
    source_database: &str,
    config: &SandboxConfig,
) -> Result<(String, String, PgPool)> {
    let mut conn = admin.acquire().await.map_err(|source| SandboxError::Connection {
        role: ConnectionRole::Admin,
        source,
    })?;

    let result = provision_on(&mut conn, source_database, config).await;
    if result.as_ref().is_err_and(SandboxError::is_timeout) {
        // Possibly mid-statement: close the socket instead of returning it.
        drop(conn.detach());
    }
    result
}

async fn provision_on(
    conn: &mut PgConnection,
    source_database: &str,
    config: &SandboxConfig,
) -> Result<(String, String, PgPool)> {
    let limit = config.connection_lifetime;
    ensure_template(
        conn,
        source_database,
        &config.template_name,
        config.provisioning,
        limit,
    )
    .await?;

    let database_name = naming::generate(&config.ephemeral_prefix);
    within(
        limit,
        "CREATE DATABASE",
        template::create_database(conn, &database_name, &config.template_name),
    )
    .await
    .map_err(|source| SandboxError::EphemeralCreation {
        name: database_name.clone(),
        source,
    })?;
    debug!(database = %database_name, "test database created from template");

    let ephemeral_url = dsn::replace_database_name(&config.source_url, &database_name);
    match open_pool(
        &ephemeral_url,
        config.max_connections,
        config,
        ConnectionRole::Ephemeral,
    )
    .await
    {
        Ok(pool) => Ok((database_name, ephemeral_url, pool)),
        Err(err) => {
            discard_database(conn, &database_name, limit).await;
            Err(err)
        }
    }
}

async fn discard_database(conn: &mut PgConnection, database: &str, limit: Duration) {
    if let Err(err) = within(limit, "DROP DATABASE", template::drop_database(conn, database)).await {
        warn!(
            database,
            error = %err,
            "failed to drop test database after a failed setup; remove it manually"
        );
    }
}

fn pool_options(max_connections: u32, lifetime: Duration) -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .max_lifetime(lifetime)
        .acquire_timeout(lifetime)
}

async fn open_pool(
    url: &str,
    max_connections: u32,
    config: &SandboxConfig,
    role: ConnectionRole,
) -> Result<PgPool> {
    let options = dsn::connect_options(url)?;
    pool_options(max_connections, config.connection_lifetime)
        .connect_with(options)
        .await
        .map_err(|source| SandboxError::Connection { role, source })
}

async fn teardown_resources(
    pool: &PgPool,
    admin: Option<PgPool>,
    database: &str,
    limit: Duration,
) -> std::result::Result<(), TeardownError> {
    let mut failures = Vec::new();

    if tokio::time::timeout(limit, pool.close()).await.is_err() {
        failures.push(TeardownFailure::new(
            TeardownStage::ConnectionClose,
            format!("pool still had checked out connections after {limit:?}"),
        ));
    }

    match admin {
        Some(admin) => {
            match admin.acquire().await {
                Ok(mut conn) => {
                    let mut stalled = false;
                    match within(
                        limit,
                        "terminating sessions",
                        template::terminate_sessions(&mut conn, database),
                    )
                    .await
                    {
                        Ok(0) => {}
                        Ok(count) => debug!(database, count, "terminated lingering sessions"),
                        Err(err) => {
                            stalled = is_timeout(&err);
                            warn!(database, error = %err, "failed to terminate sessions on test database")
                        }
                    }
                    if stalled {
                        failures.push(TeardownFailure::new(
                            TeardownStage::DropDatabase,
                            "skipped because session termination timed out",
                        ));
                    } else {
                        let dropped = within(
                            limit,
                            "DROP DATABASE",
                            template::drop_database(&mut conn, database),
                        )
                        .await;
                        match dropped {
                            Ok(()) => info!(database, "test database dropped"),
                            Err(err) => {
                                stalled = is_timeout(&err);
                                failures.push(TeardownFailure::new(
                                    TeardownStage::DropDatabase,
                                    err.to_string(),
                                ));
                            }
                        }
                    }
                    if stalled {
                        drop(conn.detach());
                    }
                }
                Err(err) => failures.push(TeardownFailure::new(
                    TeardownStage::DropDatabase,
                    format!("admin connection unavailable: {err}"),
                )),
            }

            if tokio::time::timeout(limit, admin.close()).await.is_err() {
                failures.push(TeardownFailure::new(
                    TeardownStage::AdminClose,
                    format!("admin pool did not close within {limit:?}"),
                ));
            }
        }
        None => failures.push(TeardownFailure::new(
            TeardownStage::DropDatabase,
            "admin connection already released",
        )),
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(TeardownError {
            database: database.to_string(),
            failures,
        })
    }
}
