//! Redis store for the external catalog

use super::Database;
use crate::error::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const MAX_IDLE_CONNECTIONS: usize = 10;
const SCAN_COUNT: usize = 100;

/// [`Database`] backed by a Redis server.
///
/// The blocking client runs on smol's thread pool; connections are reused
/// through a small idle pool shared by every namespace.
pub struct RedisDatabase {
    client: redis::Client,
    password: Option<String>,
    idle: Arc<Mutex<Vec<redis::Connection>>>,
}

impl RedisDatabase {
    /// Connect lazily to `address` (`host:port` or a `redis://` URL)
    pub fn new(address: &str, password: Option<String>) -> Result<Self> {
        let url = if address.contains("://") {
            address.to_string()
        } else {
            format!("redis://{address}")
        };
        info!("Using redis store at {}", url);

        Ok(Self {
            client: redis::Client::open(url)?,
            password: password.filter(|p| !p.is_empty()),
            idle: Arc::new(Mutex::new(Vec::new())),
        })
    }

    async fn with_connection<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut redis::Connection) -> redis::RedisResult<T> + Send + 'static,
    {
        let client = self.client.clone();
        let password = self.password.clone();
        let idle = self.idle.clone();

        smol::unblock(move || {
            let pooled = idle.lock().pop();
            let mut conn = match pooled {
                Some(conn) => conn,
                None => {
                    debug!("Opening redis connection");
                    let mut conn = client.get_connection()?;
                    if let Some(password) = &password {
                        redis::cmd("AUTH").arg(password).query::<()>(&mut conn)?;
                    }
                    conn
                }
            };

            let result = op(&mut conn);

            // Broken connections are not returned to the pool
            if result.is_ok() {
                let mut pool = idle.lock();
                if pool.len() < MAX_IDLE_CONNECTIONS {
                    pool.push(conn);
                }
            }
            Ok(result?)
        })
        .await
    }

    fn scan(conn: &mut redis::Connection, prefix: &str) -> redis::RedisResult<Vec<String>> {
        let pattern = format!("{}*", escape_glob(prefix));
        let mut cmd = redis::cmd("SCAN");
        cmd.cursor_arg(0)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(SCAN_COUNT);
        let keys: BTreeSet<String> = cmd.iter::<String>(conn)?.collect();
        Ok(keys.into_iter().collect())
    }
}

/// Escape glob metacharacters so `input` matches literally in `SCAN MATCH`
fn escape_glob(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for c in input.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[async_trait]
impl Database for RedisDatabase {
    async fn read_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = prefix.to_string();
        self.with_connection(move |conn| Self::scan(conn, &prefix))
            .await
    }

    async fn read_entry(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let key = key.to_string();
        self.with_connection(move |conn| redis::cmd("GET").arg(key).query(conn))
            .await
    }

    async fn read_all_entries(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let prefix = prefix.to_string();
        self.with_connection(move |conn| {
            let keys = Self::scan(conn, &prefix)?;
            if keys.is_empty() {
                return Ok(Vec::new());
            }
            let values: Vec<Option<Vec<u8>>> = redis::cmd("MGET").arg(&keys).query(conn)?;

            // Keys may expire between SCAN and MGET
            Ok(keys
                .into_iter()
                .zip(values)
                .filter_map(|(key, value)| value.map(|v| (key, v)))
                .collect())
        })
        .await
    }

    async fn insert_entry(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let key = key.to_string();
        self.with_connection(move |conn| redis::cmd("SET").arg(key).arg(value).query(conn))
            .await
    }

    async fn delete_entry(&self, key: &str) -> Result<usize> {
        let key = key.to_string();
        self.with_connection(move |conn| redis::cmd("DEL").arg(key).query(conn))
            .await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let key = key.to_string();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        self.with_connection(move |conn| {
            redis::cmd("PEXPIRE")
                .arg(key)
                .arg(ttl_ms)
                .query::<i64>(conn)
                .map(|_| ())
        })
        .await
    }
}
