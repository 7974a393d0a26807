//! DC-013: Database sessions over the sqlx `Any` driver.
//!
//! One lazily built pool per datasource. A session is either an open
//! transaction (transactional endpoint) or a plain pooled connection.
//! Acquisition uses a fixed number of attempts, each bounded by a timeout,
//! with a fixed pause between attempts.

use crate::core::error::{Error, Result};
use crate::core::registry::{DatabaseEndpoint, Datasource};
use crate::core::types::{ConnectPolicy, Engine};
use sqlx::any::{Any, AnyConnectOptions, AnyPoolOptions};
use sqlx::mysql::MySqlConnectOptions;
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgConnectOptions;
use sqlx::{AnyConnection, AnyPool, ConnectOptions, Connection, Transaction};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Boxed future returned by session operations.
pub type SessionFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Driver connect options for a database endpoint, built field by field so
/// credentials never pass through a hand-assembled URL.
pub fn connect_options(engine: Engine, db: &DatabaseEndpoint) -> Result<AnyConnectOptions> {
    let url = match engine {
        Engine::Postgres => {
            let mut opts = PgConnectOptions::new()
                .host(&db.host)
                .port(db.port)
                .username(&db.user)
                .database(&db.database);
            if let Some(password) = &db.password {
                opts = opts.password(password);
            }
            opts.to_url_lossy()
        }
        Engine::Mysql => {
            let mut opts = MySqlConnectOptions::new()
                .host(&db.host)
                .port(db.port)
                .username(&db.user)
                .database(&db.database);
            if let Some(password) = &db.password {
                opts = opts.password(password);
            }
            opts.to_url_lossy()
        }
        other => {
            return Err(Error::datasource(
                &db.database,
                format!("engine {} has no database driver", other),
            ))
        }
    };
    Ok(AnyConnectOptions::from_url(&url)?)
}

fn endpoint(ds: &Datasource) -> Result<&DatabaseEndpoint> {
    ds.database()
        .ok_or_else(|| Error::datasource(&ds.name, "not a database datasource"))
}

/// The datasource's pool, created on first use. No connection is opened yet.
pub async fn pool<'a>(ds: &'a Datasource, policy: &ConnectPolicy) -> Result<&'a AnyPool> {
    let db = endpoint(ds)?;
    ds.pool_cell()
        .get_or_try_init(|| async {
            sqlx::any::install_default_drivers();
            let options = connect_options(ds.engine, db)?;
            let pool = AnyPoolOptions::new()
                .max_connections(db.pool_size)
                .acquire_timeout(Duration::from_secs(policy.timeout_secs))
                .connect_lazy_with(options);
            tracing::debug!(datasource = %ds.name, engine = %ds.engine, "pool created");
            Ok::<_, Error>(pool)
        })
        .await
}

/// Retry `attempt` a fixed number of times, each bounded by the policy
/// timeout, pausing a fixed delay in between.
pub async fn with_attempts<T, F, Fut>(name: &str, policy: &ConnectPolicy, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let attempts = policy.attempts.max(1);
    let timeout = Duration::from_secs(policy.timeout_secs);
    let mut last = String::new();

    for n in 1..=attempts {
        match tokio::time::timeout(timeout, attempt()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => last = e.to_string(),
            Err(_) => last = format!("timed out after {}s", policy.timeout_secs),
        }
        tracing::warn!(datasource = name, attempt = n, attempts, error = %last, "connection attempt failed");
        if n < attempts {
            tokio::time::sleep(Duration::from_millis(policy.retry_delay_ms)).await;
        }
    }

    Err(Error::Connect {
        name: name.to_string(),
        attempts,
        message: last,
    })
}

/// An exclusively owned unit of database work.
pub enum Session {
    Transaction(Transaction<'static, Any>),
    Connection(PoolConnection<Any>),
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transaction(_) => write!(f, "Session::Transaction"),
            Self::Connection(_) => write!(f, "Session::Connection"),
        }
    }
}

impl Session {
    /// Open a session on a database datasource.
    pub async fn open(ds: &Datasource, policy: &ConnectPolicy) -> Result<Self> {
        let db = endpoint(ds)?;
        let pool = pool(ds, policy).await?;
        let session = if db.transactional {
            let tx = with_attempts(&ds.name, policy, || pool.begin()).await?;
            Self::Transaction(tx)
        } else {
            let conn = with_attempts(&ds.name, policy, || async {
                let mut conn = pool.acquire().await?;
                conn.ping().await?;
                Ok(conn)
            })
            .await?;
            Self::Connection(conn)
        };
        tracing::debug!(datasource = %ds.name, transactional = db.transactional, "session opened");
        Ok(session)
    }

    pub fn is_transactional(&self) -> bool {
        matches!(self, Self::Transaction(_))
    }

    fn connection(&mut self) -> &mut AnyConnection {
        match self {
            Self::Transaction(tx) => &mut **tx,
            Self::Connection(conn) => &mut **conn,
        }
    }

    /// Run raw SQL (possibly several statements). Returns affected rows.
    pub fn execute<'a>(&'a mut self, sql: &'a str) -> SessionFuture<'a, u64> {
        Box::pin(async move {
            let conn = self.connection();
            let done = sqlx::Executor::execute(conn, sqlx::raw_sql(sql)).await?;
            Ok(done.rows_affected())
        })
    }

    /// Fetch the first column of every row as an integer.
    pub fn fetch_i64<'a>(&'a mut self, sql: &'a str) -> SessionFuture<'a, Vec<i64>> {
        Box::pin(async move {
            let conn = self.connection();
            let values = sqlx::query_scalar::<Any, i64>(sql).fetch_all(conn).await?;
            Ok(values)
        })
    }

    /// Commit a transaction; a plain connection just goes back to the pool.
    pub async fn commit(self) -> Result<()> {
        if let Self::Transaction(tx) = self {
            tx.commit().await?;
        }
        Ok(())
    }

    /// Roll back a transaction; a plain connection just goes back to the pool.
    pub async fn rollback(self) -> Result<()> {
        if let Self::Transaction(tx) = self {
            tx.rollback().await?;
        }
        Ok(())
    }
}
