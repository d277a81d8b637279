use std::{env, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{error::SandboxError, naming::MAX_PREFIX_LEN, template::TemplateProvisioning};

pub(crate) const DEFAULT_TEMPLATE_NAME: &str = "template_test";
pub(crate) const DEFAULT_EPHEMERAL_PREFIX: &str = "test_db_";
pub(crate) const DEFAULT_MAX_CONNECTIONS: u32 = 10;
pub(crate) const DEFAULT_CONNECTION_LIFETIME: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_MAINTENANCE_DATABASE: &str = "postgres";
/// Used when the source descriptor does not name a database.
pub(crate) const FALLBACK_SOURCE_DATABASE: &str = "main_db";

const MAX_IDENTIFIER_LEN: usize = 63;

/// Settings for a [`crate::Sandbox`].
///
/// Empty strings and zero values are replaced with defaults when a sandbox is
/// created, so a partially filled config behaves like the default one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Source database descriptor. Overwritten with the descriptor passed to
    /// [`crate::Sandbox::new`].
    pub source_url: String,
    pub template_name: String,
    pub ephemeral_prefix: String,
    pub max_connections: u32,
    /// Pool connection lifetime, acquire timeout and close timeout.
    pub connection_lifetime: Duration,
    /// Database the admin connection uses for CREATE/DROP DATABASE.
    pub maintenance_database: String,
    pub provisioning: TemplateProvisioning,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            source_url: String::new(),
            template_name: DEFAULT_TEMPLATE_NAME.to_string(),
            ephemeral_prefix: DEFAULT_EPHEMERAL_PREFIX.to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connection_lifetime: DEFAULT_CONNECTION_LIFETIME,
            maintenance_database: DEFAULT_MAINTENANCE_DATABASE.to_string(),
            provisioning: TemplateProvisioning::default(),
        }
    }
}

impl SandboxConfig {
    /// Defaults overlaid with `SQL_SANDBOX_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let base = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let provisioning = match lookup("SQL_SANDBOX_TEMPLATE_LOCK").as_deref().and_then(parse_bool) {
            Some(true) => TemplateProvisioning::AdvisoryLock,
            Some(false) => TemplateProvisioning::Optimistic,
            None => base.provisioning,
        };

        Self {
            source_url: base.source_url,
            template_name: non_empty("SQL_SANDBOX_TEMPLATE_DB").unwrap_or(base.template_name),
            ephemeral_prefix: non_empty("SQL_SANDBOX_DB_PREFIX").unwrap_or(base.ephemeral_prefix),
            max_connections: lookup("SQL_SANDBOX_MAX_CONNECTIONS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(base.max_connections),
            connection_lifetime: lookup("SQL_SANDBOX_CONN_LIFETIME_SECS")
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(base.connection_lifetime),
            maintenance_database: non_empty("SQL_SANDBOX_MAINTENANCE_DB")
                .unwrap_or(base.maintenance_database),
            provisioning,
        }
    }

    pub fn with_template_name(mut self, name: impl Into<String>) -> Self {
        self.template_name = name.into();
        self
    }

    pub fn with_ephemeral_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.ephemeral_prefix = prefix.into();
        self
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_connection_lifetime(mut self, lifetime: Duration) -> Self {
        self.connection_lifetime = lifetime;
        self
    }

    pub fn with_maintenance_database(mut self, name: impl Into<String>) -> Self {
        self.maintenance_database = name.into();
        self
    }

    pub fn with_provisioning(mut self, provisioning: TemplateProvisioning) -> Self {
        self.provisioning = provisioning;
        self
    }

    /// Replaces empty and zero values with defaults.
    pub fn normalized(mut self) -> Self {
        let defaults = Self::default();
        if self.template_name.trim().is_empty() {
            self.template_name = defaults.template_name;
        }
        if self.ephemeral_prefix.is_empty() {
            self.ephemeral_prefix = defaults.ephemeral_prefix;
        }
        if self.max_connections == 0 {
            self.max_connections = defaults.max_connections;
        }
        if self.connection_lifetime.is_zero() {
            self.connection_lifetime = defaults.connection_lifetime;
        }
        if self.maintenance_database.trim().is_empty() {
            self.maintenance_database = defaults.maintenance_database;
        }
        self
    }

    pub fn validate(&self) -> Result<(), SandboxError> {
        if self.ephemeral_prefix.len() > MAX_PREFIX_LEN {
            return Err(SandboxError::InvalidConfig(format!(
                "ephemeral prefix '{}' is longer than {MAX_PREFIX_LEN} bytes",
                self.ephemeral_prefix
            )));
        }
        if self.template_name.len() > MAX_IDENTIFIER_LEN {
            return Err(SandboxError::InvalidConfig(format!(
                "template name '{}' is longer than {MAX_IDENTIFIER_LEN} bytes",
                self.template_name
            )));
        }
        if self.template_name.trim().is_empty() || self.maintenance_database.trim().is_empty() {
            return Err(SandboxError::InvalidConfig(
                "template and maintenance database names must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Source descriptor from `POSTGRES_URL`, falling back to `DATABASE_URL`.
pub fn source_url_from_env() -> Option<String> {
    ["POSTGRES_URL", "DATABASE_URL"]
        .into_iter()
        .filter_map(|key| env::var(key).ok())
        .find(|value| !value.trim().is_empty())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
