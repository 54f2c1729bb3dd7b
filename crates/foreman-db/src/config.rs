use std::env;

/// Database configuration.
///
/// Reads from the `FOREMAN_DATABASE_URL` environment variable, falling back
/// to `postgresql://localhost:5432/foreman` when unset.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Full PostgreSQL connection URL.
    pub database_url: String,
    /// Drop and recreate the schema on startup.
    ///
    /// Destructive. Off by default; normal startup uses
    /// `CREATE TABLE IF NOT EXISTS` semantics via the migration ledger.
    pub recreate_schema: bool,
}

impl DbConfig {
    /// The default connection URL used when no environment variable is set.
    pub const DEFAULT_URL: &str = "postgresql://localhost:5432/foreman";

    /// Build a config from the environment.
    ///
    /// Priority: `FOREMAN_DATABASE_URL` env var, then the compile-time
    /// default. `recreate_schema` is never enabled implicitly.
    pub fn from_env() -> Self {
        let database_url =
            env::var("FOREMAN_DATABASE_URL").unwrap_or_else(|_| Self::DEFAULT_URL.to_owned());
        Self {
            database_url,
            recreate_schema: false,
        }
    }

    /// Build a config from an explicit URL (useful for tests and CLI flags).
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            recreate_schema: false,
        }
    }

    /// Enable destructive schema re-creation on startup.
    pub fn with_recreate_schema(mut self, recreate: bool) -> Self {
        self.recreate_schema = recreate;
        self
    }

    /// Extract the database name from the URL.
    ///
    /// Returns `None` if the URL cannot be parsed or has no path component.
    pub fn database_name(&self) -> Option<&str> {
        // URLs look like: postgresql://host:port/dbname
        self.database_url
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
    }

    /// Return a URL pointing at the `postgres` maintenance database on the
    /// same host. Used to issue `CREATE DATABASE` when the target DB does
    /// not yet exist.
    pub fn maintenance_url(&self) -> String {
        match self.database_url.rfind('/') {
            Some(pos) => {
                let mut url = self.database_url[..pos].to_owned();
                url.push_str("/postgres");
                url
            }
            None => self.database_url.clone(),
        }
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
