mod common;

use std::time::Duration;

use anyhow::{Context, Result};
use futures::{future::join_all, FutureExt};
use sql_sandbox::{
    dsn, naming,
    template::{ensure_template, TemplateOutcome, TemplateProvisioning, ADVISORY_LOCK_NAMESPACE},
    ConnectionRole, FnVerifier, Sandbox, SandboxError, TeardownStage,
};
use sqlx::{Connection, Executor};
use tokio::time::Instant;

use common::{
    admin_connection, count_databases, database_exists, databases_with_prefix, test_url,
    SourceDatabase,
};

#[tokio::test]
async fn sandbox_clones_source_schema() -> Result<()> {
    let Some(server) = test_url() else {
        return Ok(());
    };
    let source = SourceDatabase::with_users(&server).await?;
    assert!(!database_exists(&server, &source.template).await?);

    let sandbox = Sandbox::new(&source.url, source.config()).await?;

    assert!(database_exists(&server, &source.template).await?);
    assert!(database_exists(&server, sandbox.database_name()).await?);
    assert!(sandbox.database_name().starts_with("test_db_"));
    assert_eq!(
        dsn::extract_database_name(sandbox.ephemeral_url()).as_deref(),
        Some(sandbox.database_name())
    );

    let tables: Vec<String> = sqlx::query_scalar(
        "SELECT table_name::text FROM information_schema.tables \
         WHERE table_schema = 'public' ORDER BY table_name",
    )
    .fetch_all(sandbox.connection())
    .await?;
    assert_eq!(tables, vec!["users".to_string()]);

    sqlx::query("INSERT INTO users (name) VALUES ($1)")
        .bind("alice")
        .execute(sandbox.connection())
        .await?;
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
        .fetch_one(sandbox.connection())
        .await?;
    assert_eq!(count, 1);

    let name = sandbox.database_name().to_string();
    sandbox.close().await?;
    assert!(!database_exists(&server, &name).await?);
    assert!(database_exists(&server, &source.template).await?);

    source.cleanup().await
}

#[tokio::test]
async fn basic_verifier_tolerates_missing_tracking_table() -> Result<()> {
    let Some(server) = test_url() else {
        return Ok(());
    };
    let source = SourceDatabase::empty(&server).await?;

    let sandbox = Sandbox::new(&source.url, source.config()).await?;
    sandbox.close().await?;

    source.cleanup().await
}

#[tokio::test]
async fn sandboxes_are_independent() -> Result<()> {
    let Some(server) = test_url() else {
        return Ok(());
    };
    let source = SourceDatabase::with_users(&server).await?;

    let first = Sandbox::new(&source.url, source.config()).await?;
    let second = Sandbox::new(&source.url, source.config()).await?;
    assert_ne!(first.database_name(), second.database_name());

    sqlx::query("INSERT INTO users (name) VALUES ('only-in-second')")
        .execute(second.connection())
        .await?;

    first.close().await?;

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
        .fetch_one(second.connection())
        .await?;
    assert_eq!(count, 1);

    second.close().await?;
    source.cleanup().await
}

#[tokio::test]
async fn close_twice_succeeds() -> Result<()> {
    let Some(server) = test_url() else {
        return Ok(());
    };
    let source = SourceDatabase::with_users(&server).await?;

    let sandbox = Sandbox::new(&source.url, source.config()).await?;
    sandbox.close().await?;
    sandbox.close().await?;

    source.cleanup().await
}

#[tokio::test]
async fn close_disconnects_checked_out_connections() -> Result<()> {
    let Some(server) = test_url() else {
        return Ok(());
    };
    let source = SourceDatabase::with_users(&server).await?;
    let config = source
        .config()
        .with_connection_lifetime(Duration::from_secs(2));

    let sandbox = Sandbox::new(&source.url, config).await?;
    let held = sandbox.connection().acquire().await?;

    let err = sandbox
        .close()
        .await
        .expect_err("pool close must time out while a connection is held");
    assert!(err.database_dropped());
    assert!(err
        .failures
        .iter()
        .all(|failure| failure.stage == TeardownStage::ConnectionClose));
    assert!(!database_exists(&server, sandbox.database_name()).await?);

    drop(held);
    source.cleanup().await
}

#[tokio::test]
async fn key_value_descriptors_work_end_to_end() -> Result<()> {
    let Some(server) = test_url() else {
        return Ok(());
    };
    let source = SourceDatabase::with_users(&server).await?;

    let options = dsn::connect_options(&source.url)?;
    let mut descriptor = format!(
        "host={} port={} user={} dbname={}",
        options.get_host(),
        options.get_port(),
        options.get_username(),
        source.name
    );
    if let Some(password) = url::Url::parse(&server)
        .ok()
        .and_then(|url| url.password().map(str::to_string))
    {
        descriptor.push_str(&format!(" password={password}"));
    }
    if server.contains("sslmode=disable") {
        descriptor.push_str(" sslmode=disable");
    }

    let sandbox = Sandbox::new(&descriptor, source.config()).await?;
    assert!(sandbox
        .ephemeral_url()
        .contains(&format!("dbname={}", sandbox.database_name())));
    sqlx::query("SELECT 1").execute(sandbox.connection()).await?;
    sandbox.close().await?;

    source.cleanup().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropped_sandbox_is_removed_in_background() -> Result<()> {
    let Some(server) = test_url() else {
        return Ok(());
    };
    let source = SourceDatabase::with_users(&server).await?;

    let sandbox = Sandbox::new(&source.url, source.config()).await?;
    let name = sandbox.database_name().to_string();
    drop(sandbox);

    let deadline = Instant::now() + Duration::from_secs(15);
    while database_exists(&server, &name).await? {
        anyhow::ensure!(Instant::now() < deadline, "{name} still exists after drop");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    source.cleanup().await
}

#[tokio::test]
async fn failed_ephemeral_connect_drops_the_clone() -> Result<()> {
    let Some(server) = test_url() else {
        return Ok(());
    };
    let Ok(mut role_url) = url::Url::parse(&server) else {
        return Ok(());
    };
    let mut admin = admin_connection(&server).await?;
    let superuser: bool =
        sqlx::query_scalar("SELECT rolsuper FROM pg_roles WHERE rolname = current_user")
            .fetch_one(&mut admin)
            .await?;
    if !superuser {
        eprintln!("test role is not a superuser; skipping");
        return Ok(admin.close().await?);
    }

    // The admin pool takes the role's only connection slot, so the test
    // database can be created but never connected to.
    let source = SourceDatabase::with_users(&server).await?;
    let role = naming::generate("sbx_role_");
    admin
        .execute(
            format!("CREATE ROLE \"{role}\" LOGIN CREATEDB CONNECTION LIMIT 1 PASSWORD 'sandbox-pw'")
                .as_str(),
        )
        .await?;
    admin
        .execute(format!("ALTER DATABASE \"{}\" OWNER TO \"{role}\"", source.name).as_str())
        .await?;

    role_url
        .set_username(&role)
        .ok()
        .context("server descriptor cannot carry a user name")?;
    role_url
        .set_password(Some("sandbox-pw"))
        .ok()
        .context("server descriptor cannot carry a password")?;
    let role_source = dsn::replace_database_name(role_url.as_str(), &source.name);

    let prefix = format!("leak_{}_", std::process::id() % 100_000);
    let config = source
        .config()
        .with_ephemeral_prefix(prefix.clone())
        .with_connection_lifetime(Duration::from_secs(2));
    let skip_check = FnVerifier::new(|_url: String| async { anyhow::Ok(()) }.boxed());

    let result = Sandbox::with_verifier(&role_source, config, &skip_check).await;
    let err = result.expect_err("role connection limit blocks the test database pool");
    assert!(
        matches!(
            err,
            SandboxError::Connection {
                role: ConnectionRole::Ephemeral,
                ..
            }
        ),
        "unexpected error: {err}"
    );
    assert!(database_exists(&server, &source.template).await?);
    assert_eq!(databases_with_prefix(&server, &prefix).await?, Vec::<String>::new());

    source.cleanup().await?;
    admin
        .execute(format!("DROP ROLE IF EXISTS \"{role}\"").as_str())
        .await?;
    admin.close().await?;
    Ok(())
}

#[tokio::test]
async fn locked_provisioning_gives_up_while_lock_is_held() -> Result<()> {
    let Some(server) = test_url() else {
        return Ok(());
    };
    let source = SourceDatabase::with_users(&server).await?;

    let mut holder = admin_connection(&server).await?;
    sqlx::query("SELECT pg_advisory_lock($1, hashtext($2))")
        .bind(ADVISORY_LOCK_NAMESPACE)
        .bind(&source.template)
        .execute(&mut holder)
        .await?;

    let config = source
        .config()
        .with_provisioning(TemplateProvisioning::AdvisoryLock)
        .with_connection_lifetime(Duration::from_secs(1));
    let started = Instant::now();
    let result = tokio::time::timeout(Duration::from_secs(15), Sandbox::new(&source.url, config))
        .await
        .context("sandbox creation ignored the connection lifetime")?;

    let err = result.expect_err("template lock is held by another session");
    assert!(
        matches!(err, SandboxError::TemplateCreation { .. }),
        "unexpected error: {err}"
    );
    assert!(err.is_timeout());
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(!database_exists(&server, &source.template).await?);

    sqlx::query("SELECT pg_advisory_unlock($1, hashtext($2))")
        .bind(ADVISORY_LOCK_NAMESPACE)
        .bind(&source.template)
        .execute(&mut holder)
        .await?;
    holder.close().await?;
    source.cleanup().await
}

async fn race_for_template(mode: TemplateProvisioning) -> Result<()> {
    let Some(server) = test_url() else {
        return Ok(());
    };
    let source = SourceDatabase::with_users(&server).await?;
    let admin_options = dsn::connect_options(&dsn::replace_database_name(&server, "postgres"))?;

    let attempts = (0..8).map(|_| {
        let options = admin_options.clone();
        let source_name = source.name.clone();
        let template = source.template.clone();
        tokio::spawn(async move {
            let mut conn = sqlx::PgConnection::connect_with(&options).await?;
            let outcome =
                ensure_template(&mut conn, &source_name, &template, mode, Duration::from_secs(30))
                    .await;
            conn.close().await?;
            anyhow::Ok(outcome?)
        })
    });

    let outcomes = join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined?)
        .collect::<Result<Vec<_>>>()?;

    assert_eq!(outcomes.len(), 8);
    assert_eq!(
        outcomes
            .iter()
            .filter(|outcome| **outcome == TemplateOutcome::Created)
            .count(),
        1
    );
    assert_eq!(count_databases(&server, &source.template).await?, 1);

    source.cleanup().await
}

#[tokio::test]
async fn concurrent_optimistic_provisioning_creates_one_template() -> Result<()> {
    race_for_template(TemplateProvisioning::Optimistic).await
}

#[tokio::test]
async fn concurrent_locked_provisioning_creates_one_template() -> Result<()> {
    race_for_template(TemplateProvisioning::AdvisoryLock).await
}
