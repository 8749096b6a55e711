use std::collections::HashMap;
use std::num::NonZeroUsize;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use sonde_core::{NodeId, DEAD_LETTER_PREFIX, METRICS_PREFIX, METRICS_TTL_SECS};

use super::{QueueMetrics, ReadingQueue};

#[derive(Debug, thiserror::Error)]
pub enum RedisQueueError {
    #[error("Redis connection failed: {0}")]
    Connect(#[source] redis::RedisError),

    #[error("Redis command failed: {0}")]
    Command(#[from] redis::RedisError),
}

/// Redis-backed queue: one list per node under `queue:node:<id>`, a
/// metrics hash under `metrics:<id>`, dead letters under `dlq:node:<id>`.
#[derive(Clone)]
pub struct RedisQueue {
    conn: ConnectionManager,
    queue_prefix: String,
}

impl RedisQueue {
    /// Connect with an eagerly established managed connection. The manager
    /// reconnects transparently after transient failures.
    pub async fn connect(
        url: &str,
        queue_prefix: impl Into<String>,
    ) -> Result<Self, RedisQueueError> {
        let client = redis::Client::open(url).map_err(RedisQueueError::Connect)?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(RedisQueueError::Connect)?;
        Ok(Self {
            conn,
            queue_prefix: queue_prefix.into(),
        })
    }

    pub fn url(host: &str, port: u16, password: Option<&str>) -> String {
        match password {
            Some(password) => format!("redis://:{password}@{host}:{port}/"),
            None => format!("redis://{host}:{port}/"),
        }
    }

    fn queue_key(&self, node: &NodeId) -> String {
        format!("{}{}", self.queue_prefix, node)
    }

    fn dead_letter_key(node: &NodeId) -> String {
        format!("{DEAD_LETTER_PREFIX}{node}")
    }

    fn metrics_key(node: &NodeId) -> String {
        format!("{METRICS_PREFIX}{node}")
    }
}

#[async_trait]
impl ReadingQueue for RedisQueue {
    type Error = RedisQueueError;

    async fn push_batch(&self, node: &NodeId, entries: Vec<String>) -> Result<(), Self::Error> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        // A multi-value RPUSH appends the whole batch atomically.
        conn.rpush::<_, _, ()>(self.queue_key(node), entries).await?;
        Ok(())
    }

    async fn pop_batch(&self, node: &NodeId, count: usize) -> Result<Vec<String>, Self::Error> {
        let Some(count) = NonZeroUsize::new(count) else {
            return Ok(Vec::new());
        };
        let mut conn = self.conn.clone();
        let entries: Vec<String> = conn.lpop(self.queue_key(node), Some(count)).await?;
        Ok(entries)
    }

    async fn len(&self, node: &NodeId) -> Result<u64, Self::Error> {
        let mut conn = self.conn.clone();
        Ok(conn.llen(self.queue_key(node)).await?)
    }

    async fn queued_nodes(&self) -> Result<Vec<NodeId>, Self::Error> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.keys(format!("{}*", self.queue_prefix)).await?;
        Ok(keys
            .iter()
            .filter_map(|key| key.strip_prefix(&self.queue_prefix))
            .map(NodeId::from)
            .collect())
    }

    async fn record_flush(
        &self,
        node: &NodeId,
        count: u64,
        now_ms: i64,
    ) -> Result<(), Self::Error> {
        let key = Self::metrics_key(node);
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.hincr(&key, "totalRecords", count)
            .hset(&key, "lastFlush", now_ms)
            .expire(&key, METRICS_TTL_SECS);
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn metrics(&self, node: &NodeId) -> Result<Option<QueueMetrics>, Self::Error> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(Self::metrics_key(node)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(QueueMetrics {
            total_records: fields
                .get("totalRecords")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            last_flush: fields
                .get("lastFlush")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
        }))
    }

    async fn push_dead_letter(
        &self,
        node: &NodeId,
        entries: Vec<String>,
    ) -> Result<(), Self::Error> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(Self::dead_letter_key(node), entries)
            .await?;
        Ok(())
    }
}
