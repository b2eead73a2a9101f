use super::scripts::Scripts;
use super::{CounterDecision, CounterStore, WindowAdmission, WindowCheck};
use crate::error::{QuotaError, Result};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisResult};
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time;
use tracing::{debug, info};
use uuid::Uuid;

/// Redis-backed counter store.
///
/// The connection is opened lazily and dropped after I/O failures so the
/// next call reconnects. Every command is bounded by `command_timeout`;
/// failures of any kind surface as [`QuotaError::BackendUnavailable`].
pub struct RedisStore {
    client: Client,
    connection: Mutex<Option<MultiplexedConnection>>,
    command_timeout: Duration,
    scripts: Scripts,
}

impl RedisStore {
    pub fn new(redis_url: &str, command_timeout: Duration) -> Result<Self> {
        let client = Client::open(redis_url).map_err(|e| {
            QuotaError::Configuration(format!("Failed to create Redis client: {}", e))
        })?;

        Ok(Self {
            client,
            connection: Mutex::new(None),
            command_timeout,
            scripts: Scripts::load(),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let conn = time::timeout(
            self.command_timeout,
            self.client.get_multiplexed_tokio_connection(),
        )
        .await
        .map_err(|_| QuotaError::BackendUnavailable("Timed out connecting to Redis".into()))??;

        info!("Connected to Redis counter store");
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn reset_connection(&self) {
        if self.connection.lock().await.take().is_some() {
            debug!("Dropped Redis connection after failure");
        }
    }

    async fn run<T, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match time::timeout(self.command_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
                    self.reset_connection().await;
                }
                Err(QuotaError::BackendUnavailable(format!("{} failed: {}", op, e)))
            }
            Err(_) => {
                self.reset_connection().await;
                Err(QuotaError::BackendUnavailable(format!(
                    "{} timed out after {:?}",
                    op, self.command_timeout
                )))
            }
        }
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn open(&self) -> Result<()> {
        self.connection().await.map(|_| ())
    }

    async fn close(&self) {
        self.connection.lock().await.take();
    }

    async fn check_and_increment(
        &self,
        key: &str,
        limit: u64,
        ttl: Duration,
    ) -> Result<CounterDecision> {
        let mut conn = self.connection().await?;
        let mut invocation = self.scripts.check_and_increment.key(key);
        invocation.arg(limit).arg(ttl.as_millis().max(1) as u64);

        let reply: Vec<i64> = self
            .run("check_and_increment", invocation.invoke_async(&mut conn))
            .await?;

        match reply.as_slice() {
            [allowed, count] => Ok(CounterDecision {
                allowed: *allowed == 1,
                count: (*count).max(0) as u64,
            }),
            other => Err(QuotaError::Internal(format!(
                "Unexpected check_and_increment reply: {:?}",
                other
            ))),
        }
    }

    async fn record_event(&self, key: &str, now_ms: u64, window: Duration) -> Result<u64> {
        let mut conn = self.connection().await?;
        let mut invocation = self.scripts.record_event.key(key);
        invocation
            .arg(now_ms)
            .arg(window.as_millis().max(1) as u64)
            .arg(format!("{}-{}", now_ms, Uuid::new_v4()));

        self.run("record_event", invocation.invoke_async(&mut conn))
            .await
    }

    async fn admit_event(&self, checks: &[WindowCheck], now_ms: u64) -> Result<WindowAdmission> {
        let mut conn = self.connection().await?;
        let mut invocation = self.scripts.admit_event.prepare_invoke();
        invocation
            .arg(now_ms)
            .arg(format!("{}-{}", now_ms, Uuid::new_v4()));
        for check in checks {
            invocation
                .key(&check.key)
                .arg(check.window_ms.max(1))
                .arg(check.limit);
        }

        let reply: Vec<i64> = self
            .run("admit_event", invocation.invoke_async(&mut conn))
            .await?;

        match reply.as_slice() {
            [1, 0, counts @ ..] if counts.len() == checks.len() => Ok(WindowAdmission::Admitted {
                counts: counts.iter().map(|c| (*c).max(0) as u64).collect(),
            }),
            [0, window, count, oldest_ms] => Ok(WindowAdmission::Rejected {
                window: (*window).max(0) as usize,
                count: (*count).max(0) as u64,
                oldest_ms: (*oldest_ms).max(0) as u64,
            }),
            other => Err(QuotaError::Internal(format!(
                "Unexpected admit_event reply: {:?}",
                other
            ))),
        }
    }

    async fn count_events(&self, key: &str, now_ms: u64, window: Duration) -> Result<u64> {
        let mut conn = self.connection().await?;
        let cutoff = now_ms as i64 - window.as_millis() as i64;
        self.run(
            "count_events",
            redis::cmd("ZCOUNT")
                .arg(key)
                .arg(format!("({}", cutoff))
                .arg("+inf")
                .query_async(&mut conn),
        )
        .await
    }

    async fn peek(&self, key: &str) -> Result<u64> {
        let mut conn = self.connection().await?;
        let count: Option<u64> = self
            .run("peek", redis::cmd("GET").arg(key).query_async(&mut conn))
            .await?;
        Ok(count.unwrap_or(0))
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: String = self
            .run("ping", redis::cmd("PING").query_async(&mut conn))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn get_test_store() -> Option<RedisStore> {
        let url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let store = RedisStore::new(&url, Duration::from_millis(500)).ok()?;
        store.open().await.ok()?;
        Some(store)
    }

    fn unique(prefix: &str) -> String {
        format!("quotaguard-test:{}:{}", prefix, Uuid::new_v4())
    }

    #[tokio::test]
    async fn test_invalid_url_is_configuration_error() {
        let err = RedisStore::new("not a url", Duration::from_millis(100))
            .err()
            .unwrap();
        assert!(matches!(err, QuotaError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_backend_unavailable() {
        // Port 1 is never a Redis server.
        let store = RedisStore::new("redis://127.0.0.1:1", Duration::from_millis(200)).unwrap();
        let err = store
            .check_and_increment("k", 1, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_backend_unavailable());
    }

    #[tokio::test]
    async fn test_redis_check_and_increment() {
        let Some(store) = get_test_store().await else {
            return;
        };
        let key = unique("counter");

        for expected in 1..=2 {
            let decision = store
                .check_and_increment(&key, 2, Duration::from_secs(5))
                .await
                .unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.count, expected);
        }

        let decision = store
            .check_and_increment(&key, 2, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!decision.allowed);
        assert_eq!(store.peek(&key).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_redis_admit_event_is_all_or_nothing() {
        let Some(store) = get_test_store().await else {
            return;
        };
        let minute = unique("minute");
        let day = unique("day");
        let checks = vec![
            WindowCheck::new(minute.clone(), Duration::from_secs(60), 1),
            WindowCheck::new(day.clone(), Duration::from_secs(86_400), 5),
        ];

        assert_eq!(
            store.admit_event(&checks, 1_000).await.unwrap(),
            WindowAdmission::Admitted { counts: vec![1, 1] }
        );
        assert_eq!(
            store.admit_event(&checks, 2_000).await.unwrap(),
            WindowAdmission::Rejected { window: 0, count: 1, oldest_ms: 1_000 }
        );
        assert_eq!(
            store.record_event(&day, 3_000, Duration::from_secs(86_400)).await.unwrap(),
            2
        );
    }
}
