// PostgreSQL log store: pool management and schema bootstrap
//
// Both servers share this module. The pool is created once at startup with
// bounded retry (a transient DB outage at boot should not kill the process
// immediately, but a persistent one must). Every operation acquires a
// connection from the pool and releases it when the guard drops.

pub mod repository;

use crate::config::DatabaseConfig;
use anyhow::Context;
use deadpool_postgres::{Config as DeadpoolConfig, ManagerConfig, Pool, RecyclingMethod, Runtime};
use std::time::Duration;
use tokio_postgres::NoTls;

/// Attempts before pool initialization is declared failed
const POOL_RETRY_ATTEMPTS: u32 = 3;

/// Statement timeout applied to every pooled connection (ms)
const STATEMENT_TIMEOUT_MS: u32 = 5_000;

/// Create the connection pool, verifying connectivity with bounded retry.
///
/// Retries up to 3 times with exponential backoff, then surfaces the error;
/// callers treat that as fatal at startup.
pub async fn init_pool(config: &DatabaseConfig) -> anyhow::Result<Pool> {
    let pool = build_pool(config)?;

    let mut last_error = None;
    for attempt in 0..POOL_RETRY_ATTEMPTS {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1));
            tracing::warn!(
                "database not reachable, retrying in {:?} (attempt {}/{})",
                delay,
                attempt + 1,
                POOL_RETRY_ATTEMPTS
            );
            tokio::time::sleep(delay).await;
        }

        match verify(&pool).await {
            Ok(()) => {
                warm_up(&pool, config.pool_min_size).await;
                tracing::info!(
                    host = %config.host,
                    dbname = %config.dbname,
                    max_size = config.pool_max_size,
                    "database connection pool created"
                );
                return Ok(pool);
            }
            Err(e) => last_error = Some(e),
        }
    }

    Err(last_error
        .unwrap_or_else(|| anyhow::anyhow!("pool verification failed"))
        .context(format!(
            "failed to create database pool after {POOL_RETRY_ATTEMPTS} attempts"
        )))
}

fn build_pool(config: &DatabaseConfig) -> anyhow::Result<Pool> {
    let mut cfg = DeadpoolConfig::new();
    cfg.host = Some(config.host.clone());
    cfg.port = Some(config.port);
    cfg.dbname = Some(config.dbname.clone());
    cfg.user = Some(config.user.clone());
    cfg.password = Some(config.password.clone());
    cfg.options = Some(format!("-c statement_timeout={STATEMENT_TIMEOUT_MS}"));
    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });
    cfg.pool = Some(deadpool_postgres::PoolConfig::new(config.pool_max_size));

    cfg.create_pool(Some(Runtime::Tokio1), NoTls)
        .context("invalid database pool configuration")
}

async fn verify(pool: &Pool) -> anyhow::Result<()> {
    let client = pool.get().await.context("could not acquire connection")?;
    client
        .simple_query("SELECT 1")
        .await
        .context("connectivity check failed")?;
    Ok(())
}

/// Establish `min_size` connections up-front so the first requests do not pay
/// connection latency. Failures here are non-fatal.
async fn warm_up(pool: &Pool, min_size: usize) {
    let mut held = Vec::with_capacity(min_size);
    for _ in 0..min_size {
        match pool.get().await {
            Ok(client) => held.push(client),
            Err(e) => {
                tracing::debug!("pool warm-up stopped early: {e}");
                break;
            }
        }
    }
    tracing::debug!("pool warmed with {} connections", held.len());
}

/// Create the logs table and its indexes if they do not exist.
///
/// The index set backs the query patterns the SQL generator is prompted to
/// prefer; keep the two in sync.
pub async fn ensure_schema(pool: &Pool) -> anyhow::Result<()> {
    let client = pool.get().await.context("could not acquire connection")?;
    client
        .batch_execute(
            r#"
            CREATE TABLE IF NOT EXISTS logs (
                id              BIGSERIAL PRIMARY KEY,
                created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                level           TEXT NOT NULL,
                log_type        TEXT,
                service         TEXT,
                environment     TEXT,
                service_version TEXT,
                trace_id        TEXT,
                user_id         TEXT,
                session_id      TEXT,
                error_type      TEXT,
                message         TEXT NOT NULL,
                stack_trace     TEXT,
                path            TEXT,
                method          TEXT,
                action_type     TEXT,
                function_name   TEXT,
                file_path       TEXT,
                duration_ms     DOUBLE PRECISION,
                deleted         BOOLEAN NOT NULL DEFAULT FALSE,
                metadata        JSONB
            );

            CREATE INDEX IF NOT EXISTS idx_service_level_time
                ON logs (service, level, created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_error_time
                ON logs (error_type, created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_user_time
                ON logs (user_id, created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_trace
                ON logs (trace_id);
            "#,
        )
        .await
        .context("schema bootstrap failed")?;

    tracing::info!("log store schema verified");
    Ok(())
}
