use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use super::{Expiry, ScanPage, TagStore};
use crate::error::CacheError;

/// Compare-and-delete used to release locks held by this client only.
const DEL_IF_EQ_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// Default `COUNT` hint passed to `SSCAN`.
const DEFAULT_SCAN_COUNT: usize = 100;

/// [`TagStore`] backed by a Redis connection.
///
/// Cloning is cheap: the underlying [`ConnectionManager`] multiplexes a single
/// connection and reconnects on failure.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    key_prefix: String,
    scan_count: usize,
}

impl RedisStore {
    pub fn new(connection: ConnectionManager) -> Self {
        Self {
            connection,
            key_prefix: String::new(),
            scan_count: DEFAULT_SCAN_COUNT,
        }
    }

    /// Prepends `prefix` to every key this store touches.
    ///
    /// Set members are written as given; the tagging layer records
    /// fully-qualified keys itself.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Sets the `COUNT` hint used for each `SSCAN` page.
    pub fn with_scan_count(mut self, count: usize) -> Self {
        self.scan_count = count.max(1);
        self
    }

    fn make_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    fn set_cmd(
        &self,
        key: &str,
        value: &[u8],
        expiry: Option<Expiry>,
    ) -> Result<redis::Cmd, CacheError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.make_key(key)).arg(value);
        match Expiry::validate(expiry)? {
            Some(Expiry::Seconds(secs)) => {
                cmd.arg("EX").arg(secs);
            }
            Some(Expiry::Millis(ms)) => {
                cmd.arg("PX").arg(ms);
            }
            None => {}
        }
        Ok(cmd)
    }
}

#[async_trait]
impl TagStore for RedisStore {
    fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        let mut conn = self.connection.clone();
        let data: Option<Vec<u8>> = conn.get(self.make_key(key)).await?;
        Ok(data.map(Bytes::from))
    }

    async fn set(
        &self,
        key: &str,
        value: Bytes,
        expiry: Option<Expiry>,
    ) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        let _: () = self
            .set_cmd(key, &value, expiry)?
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_nx(
        &self,
        key: &str,
        value: Bytes,
        expiry: Option<Expiry>,
    ) -> Result<bool, CacheError> {
        let mut conn = self.connection.clone();
        let mut cmd = self.set_cmd(key, &value, expiry)?;
        cmd.arg("NX");
        // `SET .. NX` replies `OK` when written and nil otherwise.
        let reply: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(reply.is_some())
    }

    async fn mset(&self, pairs: Vec<(String, Bytes)>) -> Result<(), CacheError> {
        if pairs.is_empty() {
            return Ok(());
        }
        let items: Vec<(String, Vec<u8>)> = pairs
            .into_iter()
            .map(|(key, value)| (self.make_key(&key), value.to_vec()))
            .collect();
        let mut conn = self.connection.clone();
        let _: () = conn.mset(&items).await?;
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<u64, CacheError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let keys: Vec<String> = keys.iter().map(|key| self.make_key(key)).collect();
        let mut conn = self.connection.clone();
        let removed: u64 = conn.del(keys).await?;
        Ok(removed)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, CacheError> {
        let mut conn = self.connection.clone();
        let value: i64 = conn.incr(self.make_key(key), delta).await?;
        Ok(value)
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<u64, CacheError> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection.clone();
        let added: u64 = conn.sadd(self.make_key(key), members).await?;
        Ok(added)
    }

    async fn srem(&self, key: &str, members: &[String]) -> Result<u64, CacheError> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection.clone();
        let removed: u64 = conn.srem(self.make_key(key), members).await?;
        Ok(removed)
    }

    async fn sscan(&self, key: &str, cursor: u64) -> Result<ScanPage, CacheError> {
        let mut conn = self.connection.clone();
        let (cursor, members): (u64, Vec<String>) = redis::cmd("SSCAN")
            .arg(self.make_key(key))
            .arg(cursor)
            .arg("COUNT")
            .arg(self.scan_count)
            .query_async(&mut conn)
            .await?;
        Ok(ScanPage { cursor, members })
    }

    async fn pexpire(&self, key: &str, millis: i64) -> Result<bool, CacheError> {
        let mut conn = self.connection.clone();
        let updated: i64 = redis::cmd("PEXPIRE")
            .arg(self.make_key(key))
            .arg(millis)
            .query_async(&mut conn)
            .await?;
        Ok(updated == 1)
    }

    async fn pttl(&self, key: &str) -> Result<i64, CacheError> {
        let mut conn = self.connection.clone();
        let ttl: i64 = conn.pttl(self.make_key(key)).await?;
        Ok(ttl)
    }

    async fn del_if_eq(&self, key: &str, value: &[u8]) -> Result<bool, CacheError> {
        let mut conn = self.connection.clone();
        let removed: i64 = Script::new(DEL_IF_EQ_SCRIPT)
            .key(self.make_key(key))
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }
}
