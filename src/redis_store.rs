use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script};
use tracing::debug;

use crate::model::{
    BatchId, DeviceNumber, Factory, FactoryId, NewBatch, NewDeviceNumber, ProductionBatch,
};
use crate::store::{
    BatchStore, FactoryDirectory, NumberFilter, NumberStore, Page, PageRequest, StoreError,
};

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

// Publishes a staged batch. The overlap check, the number count check and
// the key moves run inside one script, so Redis applies them atomically.
//
// KEYS: staged batch, staged numbers, batch, numbers, watermark,
//       factory batch index, global batch index
// ARGV: start serial, end serial, expected count, batch id
// Returns {1, end} on success, {0, watermark} on overlap,
//         {-1, 0} when nothing is staged, {-2, staged} when numbers are missing.
const COMMIT_SCRIPT: &str = r#"
local staged = redis.call('GET', KEYS[1])
if not staged then
  return {-1, 0}
end
local count = redis.call('LLEN', KEYS[2])
if count ~= tonumber(ARGV[3]) then
  return {-2, count}
end
local watermark = tonumber(redis.call('GET', KEYS[5]) or '0')
if tonumber(ARGV[1]) <= watermark then
  return {0, watermark}
end
redis.call('SET', KEYS[3], staged)
redis.call('DEL', KEYS[1])
redis.call('RENAME', KEYS[2], KEYS[4])
redis.call('PERSIST', KEYS[4])
redis.call('SET', KEYS[5], ARGV[2])
redis.call('ZADD', KEYS[6], ARGV[1], ARGV[4])
redis.call('ZADD', KEYS[7], ARGV[4], ARGV[4])
return {1, tonumber(ARGV[2])}
"#;

fn factory_key(factory_id: FactoryId) -> String {
    format!("factory:{}", factory_id)
}

fn watermark_key(factory_id: FactoryId) -> String {
    format!("factory:{}:watermark", factory_id)
}

fn factory_batches_key(factory_id: FactoryId) -> String {
    format!("factory:{}:batches", factory_id)
}

fn batch_key(batch_id: BatchId) -> String {
    format!("batch:{}", batch_id)
}

fn numbers_key(batch_id: BatchId) -> String {
    format!("batch:{}:numbers", batch_id)
}

fn staged_batch_key(batch_id: BatchId) -> String {
    format!("staging:batch:{}", batch_id)
}

fn staged_numbers_key(batch_id: BatchId) -> String {
    format!("staging:batch:{}:numbers", batch_id)
}

const BATCH_ID_KEY: &str = "batch:next_id";
const NUMBER_ID_KEY: &str = "number:next_id";
const ALL_BATCHES_KEY: &str = "batches";

/// Redis-backed store. Staged keys carry a TTL so an allocation that dies
/// without discarding still cleans up after itself.
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
    staging_ttl: Duration,
    commit_script: Arc<Script>,
}

impl RedisStore {
    pub async fn connect(redis_url: &str, staging_ttl: Duration) -> Result<Self, StoreError> {
        let client = Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(RedisStore {
            conn,
            staging_ttl,
            commit_script: Arc::new(Script::new(COMMIT_SCRIPT)),
        })
    }

    pub async fn put_factory(&self, factory: &Factory) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let value = serde_json::to_string(factory)?;
        conn.set::<_, _, ()>(factory_key(factory.id), value).await?;
        Ok(())
    }

    fn ttl_secs(&self) -> u64 {
        self.staging_ttl.as_secs().max(1)
    }

    async fn staged_batch(&self, batch_id: BatchId) -> Result<Option<ProductionBatch>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(staged_batch_key(batch_id)).await?;
        value
            .map(|v| serde_json::from_str(&v).map_err(StoreError::from))
            .transpose()
    }

    async fn numbers_of(&self, batch_id: BatchId) -> Result<Vec<DeviceNumber>, StoreError> {
        let mut conn = self.conn.clone();
        let values: Vec<String> = conn.lrange(numbers_key(batch_id), 0, -1).await?;
        values
            .iter()
            .map(|v| serde_json::from_str(v).map_err(StoreError::from))
            .collect()
    }
}

#[async_trait]
impl FactoryDirectory for RedisStore {
    async fn get(&self, factory_id: FactoryId) -> Result<Option<Factory>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(factory_key(factory_id)).await?;
        match value {
            Some(value) => Ok(Some(serde_json::from_str(&value)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl BatchStore for RedisStore {
    async fn max_end_serial(&self, factory_id: FactoryId) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let watermark: Option<u64> = conn.get(watermark_key(factory_id)).await?;
        Ok(watermark.unwrap_or(0))
    }

    async fn insert(&self, batch: NewBatch) -> Result<ProductionBatch, StoreError> {
        let mut conn = self.conn.clone();
        let id: BatchId = conn.incr(BATCH_ID_KEY, 1).await?;
        let batch = ProductionBatch::from_new(id, batch, Utc::now());
        let value = serde_json::to_string(&batch)?;

        let _: () = redis::cmd("SET")
            .arg(staged_batch_key(id))
            .arg(value)
            .arg("EX")
            .arg(self.ttl_secs())
            .query_async(&mut conn)
            .await?;
        debug!(batch_id = id, factory_id = batch.factory_id, "staged batch");
        Ok(batch)
    }

    async fn commit(&self, batch_id: BatchId) -> Result<ProductionBatch, StoreError> {
        let batch = self
            .staged_batch(batch_id)
            .await?
            .ok_or(StoreError::NotStaged(batch_id))?;

        let mut conn = self.conn.clone();
        let mut invocation = self.commit_script.prepare_invoke();
        invocation
            .key(staged_batch_key(batch_id))
            .key(staged_numbers_key(batch_id))
            .key(batch_key(batch_id))
            .key(numbers_key(batch_id))
            .key(watermark_key(batch.factory_id))
            .key(factory_batches_key(batch.factory_id))
            .key(ALL_BATCHES_KEY)
            .arg(batch.start_serial)
            .arg(batch.end_serial)
            .arg(batch.len())
            .arg(batch_id);
        let (status, value): (i64, i64) = invocation.invoke_async(&mut conn).await?;

        match status {
            1 => Ok(batch),
            0 => Err(StoreError::WatermarkConflict {
                watermark: value.max(0) as u64,
            }),
            -1 => Err(StoreError::NotStaged(batch_id)),
            _ => Err(StoreError::Incomplete {
                batch_id,
                staged: value.max(0) as u64,
                expected: batch.len(),
            }),
        }
    }

    async fn discard(&self, batch_id: BatchId) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(staged_batch_key(batch_id))
            .ignore()
            .del(staged_numbers_key(batch_id))
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn get_batch(&self, batch_id: BatchId) -> Result<Option<ProductionBatch>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(batch_key(batch_id)).await?;
        match value {
            Some(value) => Ok(Some(serde_json::from_str(&value)?)),
            None => Ok(None),
        }
    }

    async fn list_by_factory(
        &self,
        factory_id: FactoryId,
    ) -> Result<Vec<ProductionBatch>, StoreError> {
        let mut conn = self.conn.clone();
        let ids: Vec<BatchId> = conn.zrange(factory_batches_key(factory_id), 0, -1).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = ids.into_iter().map(batch_key).collect();
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await?;
        values
            .into_iter()
            .flatten()
            .map(|v| serde_json::from_str(&v).map_err(StoreError::from))
            .collect()
    }
}

#[async_trait]
impl NumberStore for RedisStore {
    async fn bulk_insert(&self, numbers: Vec<NewDeviceNumber>) -> Result<usize, StoreError> {
        if numbers.is_empty() {
            return Ok(0);
        }

        let mut by_batch: BTreeMap<BatchId, Vec<NewDeviceNumber>> = BTreeMap::new();
        for number in numbers {
            by_batch.entry(number.batch_id).or_default().push(number);
        }

        let mut conn = self.conn.clone();
        let now = Utc::now();
        let mut inserted = 0;
        for (batch_id, numbers) in by_batch {
            let staged: bool = conn.exists(staged_batch_key(batch_id)).await?;
            if !staged {
                return Err(StoreError::NotStaged(batch_id));
            }

            let count = numbers.len() as u64;
            let last_id: u64 = conn.incr(NUMBER_ID_KEY, count).await?;
            let first_id = last_id + 1 - count;
            let values = numbers
                .into_iter()
                .enumerate()
                .map(|(i, n)| serde_json::to_string(&DeviceNumber::from_new(first_id + i as u64, n, now)))
                .collect::<Result<Vec<_>, _>>()?;

            let key = staged_numbers_key(batch_id);
            let mut pipe = redis::pipe();
            pipe.atomic()
                .rpush(&key, values)
                .ignore()
                .cmd("EXPIRE")
                .arg(&key)
                .arg(self.ttl_secs())
                .ignore()
                .cmd("EXPIRE")
                .arg(staged_batch_key(batch_id))
                .arg(self.ttl_secs())
                .ignore();
            let _: () = pipe.query_async(&mut conn).await?;
            inserted += count as usize;
        }
        Ok(inserted)
    }

    async fn query(
        &self,
        filter: &NumberFilter,
        page: PageRequest,
    ) -> Result<Page<DeviceNumber>, StoreError> {
        let batch_ids: Vec<BatchId> = match filter.batch_id {
            Some(batch_id) => vec![batch_id],
            None => {
                let mut conn = self.conn.clone();
                conn.zrange(ALL_BATCHES_KEY, 0, -1).await?
            }
        };

        let mut matched = Vec::new();
        for batch_id in batch_ids {
            matched.extend(
                self.numbers_of(batch_id)
                    .await?
                    .into_iter()
                    .filter(|n| filter.matches(n)),
            );
        }
        matched.sort_by_key(|n| n.id);
        Ok(Page::slice(matched, page))
    }
}
