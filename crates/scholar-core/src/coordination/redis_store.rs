//! Redis-backed hint store.

use std::time::Duration;

use redis::{Client, Commands, Connection};

use crate::error::Result;

use super::hints::HintStore;

/// Bound on connecting to Redis and on each command.
pub const DEFAULT_REDIS_TIMEOUT: Duration = Duration::from_secs(2);

/// Hint store talking to a Redis server.
///
/// Each call opens its own short-lived connection so a restarted or
/// unreachable server never wedges the caller for longer than the timeout.
#[derive(Debug, Clone)]
pub struct RedisHintStore {
    client: Client,
    timeout: Duration,
}

impl RedisHintStore {
    /// Parse `url` (e.g. `redis://localhost:6379`). Does not connect.
    pub fn open(url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::open(url)?;
        Ok(Self { client, timeout })
    }

    fn connection(&self) -> Result<Connection> {
        let conn = self.client.get_connection_with_timeout(self.timeout)?;
        conn.set_read_timeout(Some(self.timeout))?;
        conn.set_write_timeout(Some(self.timeout))?;
        Ok(conn)
    }
}

impl HintStore for RedisHintStore {
    fn ping(&self) -> Result<()> {
        let mut conn = self.connection()?;
        redis::cmd("PING").query::<String>(&mut conn)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection()?;
        let value: Option<String> = conn.get(key)?;
        Ok(value)
    }

    fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.connection()?;
        let seconds = ttl.as_secs().max(1);
        conn.set_ex::<_, _, ()>(key, value, seconds)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.connection()?;
        conn.del::<_, ()>(key)?;
        Ok(())
    }
}
