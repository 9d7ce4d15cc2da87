//! PostgreSQL connection pools.

use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tokio_postgres::{Config as PgConfig, NoTls};
use tracing::info;

use crate::config::PgConnectionConfig;
use crate::error::{MigrateError, Result};

/// Create a pool and verify it can hand out a working connection.
pub async fn create_pool(config: &PgConnectionConfig, context: &str) -> Result<Pool> {
    let mut pg_config = PgConfig::new();
    pg_config.host(&config.host);
    pg_config.port(config.port);
    pg_config.dbname(&config.database);
    pg_config.user(&config.user);
    pg_config.password(&config.password);

    let mgr_config = ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    };

    let mgr = Manager::from_config(pg_config, NoTls, mgr_config);
    let pool = Pool::builder(mgr)
        .max_size(config.get_max_connections())
        .build()
        .map_err(|e| MigrateError::pool(format!("Failed to create pool: {}", e), context))?;

    let client = pool
        .get()
        .await
        .map_err(|e| MigrateError::pool(format!("Failed to get connection: {}", e), context))?;

    client
        .simple_query("SELECT 1")
        .await
        .map_err(MigrateError::Target)?;

    info!(
        "Connected to PostgreSQL ({}): {}:{}/{}",
        context, config.host, config.port, config.database
    );

    Ok(pool)
}

/// Quote an identifier for interpolation into SQL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Whether a SQLSTATE denotes bad data rather than a broken connection:
/// class 22 (data exception) or 23 (integrity constraint violation).
pub fn is_data_error(sqlstate: &str) -> bool {
    sqlstate.starts_with("22") || sqlstate.starts_with("23")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("history"), "\"history\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_data_error_classes() {
        assert!(is_data_error("22001")); // string_data_right_truncation
        assert!(is_data_error("23514")); // check_violation
        assert!(!is_data_error("08006")); // connection_failure
        assert!(!is_data_error("40001")); // serialization_failure
    }
}
