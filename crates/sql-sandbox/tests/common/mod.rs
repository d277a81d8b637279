#![allow(dead_code)]

use std::{path::PathBuf, sync::Once};

use anyhow::{Context, Result};
use sql_sandbox::{dsn, naming, source_url_from_env, SandboxConfig};
use sqlx::{Connection, Executor, PgConnection};
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Server descriptor for tests that need PostgreSQL. `None` skips the test.
pub fn test_url() -> Option<String> {
    init_tracing();
    let url = std::env::var("SQL_SANDBOX_TEST_URL")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .or_else(source_url_from_env);
    if url.is_none() {
        eprintln!("SQL_SANDBOX_TEST_URL, POSTGRES_URL or DATABASE_URL not set; skipping");
    }
    url
}

pub fn fixture_migrations() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/migrations")
}

pub async fn admin_connection(url: &str) -> Result<PgConnection> {
    let admin_url = dsn::replace_database_name(url, "postgres");
    PgConnection::connect_with(&dsn::connect_options(&admin_url)?)
        .await
        .context("failed to connect to maintenance database")
}

pub async fn database_exists(url: &str, name: &str) -> Result<bool> {
    let mut conn = admin_connection(url).await?;
    let exists =
        sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
            .bind(name)
            .fetch_one(&mut conn)
            .await?;
    conn.close().await?;
    Ok(exists)
}

pub async fn count_databases(url: &str, name: &str) -> Result<i64> {
    let mut conn = admin_connection(url).await?;
    let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM pg_database WHERE datname = $1")
        .bind(name)
        .fetch_one(&mut conn)
        .await?;
    conn.close().await?;
    Ok(count)
}

pub async fn databases_with_prefix(url: &str, prefix: &str) -> Result<Vec<String>> {
    let mut conn = admin_connection(url).await?;
    let names: Vec<String> = sqlx::query_scalar("SELECT datname::text FROM pg_database")
        .fetch_all(&mut conn)
        .await?;
    conn.close().await?;
    Ok(names
        .into_iter()
        .filter(|name| name.starts_with(prefix))
        .collect())
}

pub async fn drop_databases(url: &str, names: &[&str]) -> Result<()> {
    let mut conn = admin_connection(url).await?;
    for name in names {
        conn.execute(format!("DROP DATABASE IF EXISTS \"{name}\"").as_str())
            .await?;
    }
    conn.close().await?;
    Ok(())
}

/// A freshly created source database with its own template name, so tests
/// can run in parallel against one server.
pub struct SourceDatabase {
    pub url: String,
    pub name: String,
    pub template: String,
    server_url: String,
}

impl SourceDatabase {
    /// Source with a `users` table and no migration tracking table.
    pub async fn with_users(server_url: &str) -> Result<Self> {
        let source = Self::empty(server_url).await?;
        let mut conn = PgConnection::connect_with(&dsn::connect_options(&source.url)?).await?;
        conn.execute("CREATE TABLE users (id BIGSERIAL PRIMARY KEY, name TEXT NOT NULL)")
            .await?;
        conn.close().await?;
        Ok(source)
    }

    pub async fn empty(server_url: &str) -> Result<Self> {
        let name = naming::generate("src_");
        let template = naming::generate("tpl_");

        let mut admin = admin_connection(server_url).await?;
        admin
            .execute(format!("CREATE DATABASE \"{name}\"").as_str())
            .await
            .with_context(|| format!("failed to create source database {name}"))?;
        admin.close().await?;

        Ok(Self {
            url: dsn::replace_database_name(server_url, &name),
            name,
            template,
            server_url: server_url.to_string(),
        })
    }

    pub fn config(&self) -> SandboxConfig {
        SandboxConfig::default().with_template_name(self.template.clone())
    }

    pub async fn cleanup(self) -> Result<()> {
        drop_databases(&self.server_url, &[&self.template, &self.name]).await
    }
}
