//! Redis-backed [`CounterStore`].

use std::fmt;
use std::time::Duration;

use redis::aio::ConnectionManager;

use crate::error::{GuardError, GuardResult};
use crate::store::{ClientKeys, CounterStore, StoreCount, StoreFuture};

/// `KEYS[1]` count key, `KEYS[2]` block key, `ARGV[1]` window in ms.
///
/// A present block key short-circuits; otherwise the count is incremented and
/// its expiry set only when the key was just created, so the window is
/// anchored at the first request.
const INCREMENT: &str = r"
local blocked = redis.call('GET', KEYS[2])
if blocked then
    return {tonumber(blocked), 1}
end
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return {count, 0}
";

/// `KEYS[1]` count key, `KEYS[2]` block key, `ARGV[1]` block duration in ms.
const PLACE_BLOCK: &str = r"
local count = tonumber(redis.call('GET', KEYS[1]) or '1')
redis.call('SET', KEYS[2], count, 'PX', ARGV[1])
redis.call('SET', KEYS[1], count, 'PX', ARGV[1])
return count
";

/// Shared counter store on top of a Redis connection manager.
///
/// The connection manager reconnects on its own; failed calls surface as
/// store errors and the detector falls back to local tracking for them.
#[derive(Clone)]
pub struct RedisCounterStore {
    conn: ConnectionManager,
    increment_script: redis::Script,
    block_script: redis::Script,
}

impl fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCounterStore").finish_non_exhaustive()
    }
}

impl RedisCounterStore {
    /// Connect to the Redis server at `url`.
    ///
    /// # Errors
    ///
    /// Returns `GuardError::StoreUnavailable` if the URL is invalid or the
    /// initial connection fails.
    pub async fn connect(url: &str) -> GuardResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| GuardError::StoreUnavailable(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| GuardError::StoreUnavailable(e.to_string()))?;
        Ok(Self::from_manager(conn))
    }

    /// Wrap an existing connection manager.
    #[must_use]
    pub fn from_manager(conn: ConnectionManager) -> Self {
        Self {
            conn,
            increment_script: redis::Script::new(INCREMENT),
            block_script: redis::Script::new(PLACE_BLOCK),
        }
    }
}

fn store_error(err: &redis::RedisError) -> GuardError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
        GuardError::StoreUnavailable(err.to_string())
    } else {
        GuardError::Store(err.to_string())
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

impl CounterStore for RedisCounterStore {
    fn increment<'a>(
        &'a self,
        keys: &'a ClientKeys,
        window: Duration,
    ) -> StoreFuture<'a, StoreCount> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let (count, blocked): (u64, u8) = self
                .increment_script
                .key(&keys.count)
                .key(&keys.block)
                .arg(ttl_millis(window))
                .invoke_async(&mut conn)
                .await
                .map_err(|e| store_error(&e))?;
            Ok(StoreCount {
                count,
                blocked: blocked != 0,
            })
        })
    }

    fn place_block<'a>(&'a self, keys: &'a ClientKeys, ttl: Duration) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let _count: u64 = self
                .block_script
                .key(&keys.count)
                .key(&keys.block)
                .arg(ttl_millis(ttl))
                .invoke_async(&mut conn)
                .await
                .map_err(|e| store_error(&e))?;
            Ok(())
        })
    }
}
