//! PostgreSQL connection pools.

mod tls;

pub use tls::{SslMode, TlsBuilder};

use std::time::{Duration, Instant};

use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tokio_postgres::Config as PgConfig;
use tracing::{info, warn};

use crate::config::ConnectionConfig;
use crate::error::{MigrateError, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const APPLICATION_NAME: &str = "pg-schema-sync";

/// Build the driver configuration for one database.
pub fn pg_config(conn: &ConnectionConfig) -> Result<PgConfig> {
    let ssl_mode = SslMode::parse(&conn.ssl_mode)?;

    let mut pg_config = PgConfig::new();
    pg_config.host(&conn.host);
    pg_config.port(conn.port);
    pg_config.dbname(&conn.dbname);
    pg_config.user(&conn.user);
    pg_config.password(&conn.password);
    pg_config.application_name(APPLICATION_NAME);
    pg_config.ssl_mode(ssl_mode.pg_mode());

    // Connection options for reliability
    pg_config.keepalives(true);
    pg_config.keepalives_idle(Duration::from_secs(30));
    pg_config.connect_timeout(CONNECT_TIMEOUT);

    Ok(pg_config)
}

/// Create a pool for `conn` and verify it with a round trip.
///
/// `role` names the database in logs and errors ("source", "target staging").
pub async fn connect_pool(conn: &ConnectionConfig, max_size: usize, role: &str) -> Result<Pool> {
    let ssl_mode = SslMode::parse(&conn.ssl_mode)?;
    let pg_config = pg_config(conn)?;
    let mgr_config = ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    };

    let pool = match TlsBuilder::new(ssl_mode).build()? {
        None => {
            warn!(
                "{}: TLS is disabled. Credentials will be transmitted in plaintext.",
                role
            );
            let mgr = Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config);
            Pool::builder(mgr)
                .max_size(max_size)
                .build()
                .map_err(|e| MigrateError::pool(e, format!("creating {} pool", role)))?
        }
        Some(tls) => {
            let mgr = Manager::from_config(pg_config, tls, mgr_config);
            Pool::builder(mgr)
                .max_size(max_size)
                .build()
                .map_err(|e| MigrateError::pool(e, format!("creating {} pool", role)))?
        }
    };

    let client = pool
        .get()
        .await
        .map_err(|e| MigrateError::pool(e, format!("connecting to {} {}", role, conn.describe())))?;
    client.simple_query("SELECT 1").await?;

    info!("Connected to PostgreSQL {}: {}", role, conn.describe());
    Ok(pool)
}

/// Round-trip a trivial query and return the latency.
pub async fn ping(pool: &Pool, role: &str) -> Result<Duration> {
    let started = Instant::now();
    let client = pool
        .get()
        .await
        .map_err(|e| MigrateError::pool(e, format!("health check on {}", role)))?;
    client.simple_query("SELECT 1").await?;
    Ok(started.elapsed())
}
