//! Template database provisioning and the catalog statements shared with the
//! sandbox lifecycle.

use std::{future::Future, io, time::Duration};

use serde::{Deserialize, Serialize};
use sqlx::{Executor, PgConnection};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::error::{is_timeout, SandboxError};

const DUPLICATE_DATABASE: &str = "42P04";
const UNIQUE_VIOLATION: &str = "23505";
const DUPLICATE_SIGNATURES: [&str; 3] = [
    "already exists",
    "duplicate key value violates unique constraint",
    "pg_database_datname_index",
];

/// First key of the two-key advisory lock taken in
/// [`TemplateProvisioning::AdvisoryLock`] mode. The second key is
/// `hashtext(<template name>)`.
pub const ADVISORY_LOCK_NAMESPACE: i32 = 0x5d5b_0001;

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How concurrent callers agree on a single template database.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateProvisioning {
    /// Issue `CREATE DATABASE` straight away and treat a duplicate error, or
    /// a template that exists by the time the error is inspected, as success.
    #[default]
    Optimistic,
    /// Serialize provisioning on a session advisory lock keyed on the
    /// template name and check the catalog before creating.
    AdvisoryLock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateOutcome {
    Created,
    /// The template was already present (catalog pre-check or a duplicate
    /// error from the server).
    AlreadyExisted,
    /// Creation failed with an unrecognized error but the template exists
    /// now, so another caller created it first.
    CreatedConcurrently,
}

/// Makes sure `template` exists as a clone of `source`.
///
/// `conn` must be connected to a maintenance database, never to `source`
/// itself, because PostgreSQL refuses to clone a database with open sessions.
///
/// Waiting for the advisory lock and every statement are bounded by `limit`.
/// After a timeout ([`SandboxError::is_timeout`]) the connection may still be
/// busy on the server and should be discarded rather than reused.
#[instrument(skip(conn))]
pub async fn ensure_template(
    conn: &mut PgConnection,
    source: &str,
    template: &str,
    mode: TemplateProvisioning,
    limit: Duration,
) -> Result<TemplateOutcome, SandboxError> {
    let outcome = match mode {
        TemplateProvisioning::Optimistic => create_tolerant(conn, source, template, limit).await?,
        TemplateProvisioning::AdvisoryLock => {
            acquire_template_lock(conn, template, limit)
                .await
                .map_err(|err| template_error(template, err))?;

            let result = provision_locked(conn, source, template, limit).await;

            if result.as_ref().is_err_and(SandboxError::is_timeout) {
                debug!(template, "leaving advisory lock to the discarded session");
            } else if let Err(err) = within(
                limit,
                "releasing the template lock",
                sqlx::query("SELECT pg_advisory_unlock($1, hashtext($2))")
                    .bind(ADVISORY_LOCK_NAMESPACE)
                    .bind(template)
                    .execute(&mut *conn),
            )
            .await
            {
                warn!(template, error = %err, "failed to release template advisory lock");
            }
            result?
        }
    };

    match outcome {
        TemplateOutcome::Created => info!(template, source, "template database created"),
        _ => debug!(template, ?outcome, "template database already present"),
    }
    Ok(outcome)
}

/// Polls `pg_try_advisory_lock` so a lock held by another session never
/// blocks the connection past `limit`.
async fn acquire_template_lock(
    conn: &mut PgConnection,
    template: &str,
    limit: Duration,
) -> Result<(), sqlx::Error> {
    let deadline = Instant::now() + limit;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let locked = within(
            remaining,
            "acquiring the template lock",
            sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock($1, hashtext($2))")
                .bind(ADVISORY_LOCK_NAMESPACE)
                .bind(template)
                .fetch_one(&mut *conn),
        )
        .await?;
        if locked {
            return Ok(());
        }
        if Instant::now() + LOCK_POLL_INTERVAL >= deadline {
            return Err(timed_out("waiting for the template lock", limit));
        }
        tokio::time::sleep(LOCK_POLL_INTERVAL).await;
    }
}

async fn provision_locked(
    conn: &mut PgConnection,
    source: &str,
    template: &str,
    limit: Duration,
) -> Result<TemplateOutcome, SandboxError> {
    let exists = within(limit, "template lookup", database_exists(conn, template))
        .await
        .map_err(|err| template_error(template, err))?;
    if exists {
        return Ok(TemplateOutcome::AlreadyExisted);
    }
    create_tolerant(conn, source, template, limit).await
}

async fn create_tolerant(
    conn: &mut PgConnection,
    source: &str,
    template: &str,
    limit: Duration,
) -> Result<TemplateOutcome, SandboxError> {
    let err = match within(limit, "CREATE DATABASE", create_database(conn, template, source)).await
    {
        Ok(()) => return Ok(TemplateOutcome::Created),
        Err(err) => err,
    };

    // The statement may still be running; the connection can't be reused.
    if is_timeout(&err) {
        return Err(template_error(template, err));
    }

    if is_duplicate_database(&err) {
        debug!(template, error = %err, "template creation lost the race");
        return Ok(TemplateOutcome::AlreadyExisted);
    }

    match within(limit, "template lookup", database_exists(conn, template)).await {
        Ok(true) => Ok(TemplateOutcome::CreatedConcurrently),
        Ok(false) => Err(template_error(template, err)),
        Err(check_err) => {
            debug!(template, error = %check_err, "template existence re-check failed");
            Err(template_error(template, err))
        }
    }
}

/// Runs a statement future, turning an overrun of `limit` into an I/O
/// `TimedOut` error.
pub(crate) async fn within<T, F>(
    limit: Duration,
    operation: &str,
    future: F,
) -> Result<T, sqlx::Error>
where
    F: Future<Output = Result<T, sqlx::Error>>,
{
    tokio::time::timeout(limit, future)
        .await
        .unwrap_or_else(|_| Err(timed_out(operation, limit)))
}

pub(crate) fn timed_out(operation: &str, limit: Duration) -> sqlx::Error {
    sqlx::Error::Io(io::Error::new(
        io::ErrorKind::TimedOut,
        format!("{operation} did not finish within {limit:?}"),
    ))
}

fn template_error(template: &str, source: sqlx::Error) -> SandboxError {
    SandboxError::TemplateCreation {
        template: template.to_string(),
        source,
    }
}

/// Whether `error` reports that the database being created already exists.
pub(crate) fn is_duplicate_database(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db_err) => {
            matches!(
                db_err.code().as_deref(),
                Some(DUPLICATE_DATABASE | UNIQUE_VIOLATION)
            ) || is_duplicate_message(db_err.message())
        }
        other => is_duplicate_message(&other.to_string()),
    }
}

pub(crate) fn is_duplicate_message(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    DUPLICATE_SIGNATURES
        .iter()
        .any(|signature| message.contains(signature))
}

pub(crate) fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

pub(crate) async fn database_exists(
    conn: &mut PgConnection,
    name: &str,
) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
        .bind(name)
        .fetch_one(&mut *conn)
        .await
}

pub(crate) async fn create_database(
    conn: &mut PgConnection,
    name: &str,
    template: &str,
) -> Result<(), sqlx::Error> {
    let statement = format!(
        "CREATE DATABASE {} TEMPLATE {}",
        quote_ident(name),
        quote_ident(template)
    );
    conn.execute(statement.as_str()).await.map(|_| ())
}

pub(crate) async fn drop_database(conn: &mut PgConnection, name: &str) -> Result<(), sqlx::Error> {
    let statement = format!("DROP DATABASE IF EXISTS {}", quote_ident(name));
    conn.execute(statement.as_str()).await.map(|_| ())
}

/// Disconnects every other session attached to `name`. Returns how many
/// backends were signalled.
pub(crate) async fn terminate_sessions(
    conn: &mut PgConnection,
    name: &str,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
         WHERE datname = $1 AND pid <> pg_backend_pid()",
    )
    .bind(name)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}
