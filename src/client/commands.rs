//! Typed commands over [`ShardedClient::execute`].
//!
//! Single-key commands route by their key. `mget` and `mset` split their
//! keys by owning node and issue one command per node.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::client::ShardedClient;
use crate::config::Endpoint;
use crate::node::resp::RespValue;
use crate::pool::{ActivePool, CacheConnection, Connector, NodePool, PoolError};

/// TTL state of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    Missing,
    NoExpiry,
    Seconds(i64),
}

fn server_error(message: Vec<u8>) -> PoolError {
    PoolError::Server(String::from_utf8_lossy(&message).into_owned())
}

fn unexpected(value: RespValue) -> PoolError {
    PoolError::UnexpectedResponse(format!("{:?}", value))
}

fn expect_ok(value: RespValue) -> Result<(), PoolError> {
    match value {
        value if value.is_ok() => Ok(()),
        RespValue::Error(message) => Err(server_error(message)),
        other => Err(unexpected(other)),
    }
}

fn expect_bulk(value: RespValue) -> Result<Option<Vec<u8>>, PoolError> {
    match value {
        RespValue::Bulk(data) => Ok(data),
        RespValue::Error(message) => Err(server_error(message)),
        other => Err(unexpected(other)),
    }
}

fn expect_int(value: RespValue) -> Result<i64, PoolError> {
    match value {
        RespValue::Integer(n) => Ok(n),
        RespValue::Error(message) => Err(server_error(message)),
        other => Err(unexpected(other)),
    }
}

fn expect_array(value: RespValue) -> Result<Vec<RespValue>, PoolError> {
    match value {
        RespValue::Array(items) => Ok(items.unwrap_or_default()),
        RespValue::Error(message) => Err(server_error(message)),
        other => Err(unexpected(other)),
    }
}

fn expect_bulk_list(value: RespValue) -> Result<Vec<Vec<u8>>, PoolError> {
    expect_array(value)?
        .into_iter()
        .map(|item| match item {
            RespValue::Bulk(Some(data)) => Ok(data),
            other => Err(unexpected(other)),
        })
        .collect()
}

fn pairs(items: Vec<Vec<u8>>) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut out = Vec::with_capacity(items.len() / 2);
    let mut iter = items.into_iter();
    while let (Some(a), Some(b)) = (iter.next(), iter.next()) {
        out.push((a, b));
    }
    out
}

impl<C: Connector> ShardedClient<C> {
    pub async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, PoolError> {
        expect_bulk(self.execute(key, &[b"GET", key]).await?)
    }

    pub async fn set(&self, key: &[u8], value: &[u8]) -> Result<(), PoolError> {
        expect_ok(self.execute(key, &[b"SET", key, value]).await?)
    }

    /// SET with an expiry in seconds.
    pub async fn set_ex(&self, key: &[u8], value: &[u8], seconds: u64) -> Result<(), PoolError> {
        let seconds = seconds.to_string();
        expect_ok(
            self.execute(key, &[b"SET", key, value, b"EX", seconds.as_bytes()])
                .await?,
        )
    }

    /// Returns true if the key existed.
    pub async fn del(&self, key: &[u8]) -> Result<bool, PoolError> {
        Ok(expect_int(self.execute(key, &[b"DEL", key]).await?)? > 0)
    }

    pub async fn exists(&self, key: &[u8]) -> Result<bool, PoolError> {
        Ok(expect_int(self.execute(key, &[b"EXISTS", key]).await?)? > 0)
    }

    /// Returns true if the timeout was set.
    pub async fn expire(&self, key: &[u8], seconds: u64) -> Result<bool, PoolError> {
        let seconds = seconds.to_string();
        Ok(expect_int(self.execute(key, &[b"EXPIRE", key, seconds.as_bytes()]).await?)? == 1)
    }

    pub async fn ttl(&self, key: &[u8]) -> Result<Ttl, PoolError> {
        Ok(match expect_int(self.execute(key, &[b"TTL", key]).await?)? {
            -2 => Ttl::Missing,
            -1 => Ttl::NoExpiry,
            n => Ttl::Seconds(n),
        })
    }

    pub async fn incr_by(&self, key: &[u8], delta: i64) -> Result<i64, PoolError> {
        let delta = delta.to_string();
        expect_int(self.execute(key, &[b"INCRBY", key, delta.as_bytes()]).await?)
    }

    pub async fn hget(&self, key: &[u8], field: &[u8]) -> Result<Option<Vec<u8>>, PoolError> {
        expect_bulk(self.execute(key, &[b"HGET", key, field]).await?)
    }

    /// Returns true if the field was newly created.
    pub async fn hset(&self, key: &[u8], field: &[u8], value: &[u8]) -> Result<bool, PoolError> {
        Ok(expect_int(self.execute(key, &[b"HSET", key, field, value]).await?)? == 1)
    }

    pub async fn hgetall(&self, key: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, PoolError> {
        Ok(pairs(expect_bulk_list(
            self.execute(key, &[b"HGETALL", key]).await?,
        )?))
    }

    /// Returns the list length after the push.
    pub async fn lpush(&self, key: &[u8], values: &[&[u8]]) -> Result<i64, PoolError> {
        let mut args: Vec<&[u8]> = Vec::with_capacity(values.len() + 2);
        args.push(b"LPUSH");
        args.push(key);
        args.extend_from_slice(values);
        expect_int(self.execute(key, &args).await?)
    }

    pub async fn lrange(&self, key: &[u8], start: i64, stop: i64) -> Result<Vec<Vec<u8>>, PoolError> {
        let (start, stop) = (start.to_string(), stop.to_string());
        expect_bulk_list(
            self.execute(key, &[b"LRANGE", key, start.as_bytes(), stop.as_bytes()])
                .await?,
        )
    }

    pub async fn ltrim(&self, key: &[u8], start: i64, stop: i64) -> Result<(), PoolError> {
        let (start, stop) = (start.to_string(), stop.to_string());
        expect_ok(
            self.execute(key, &[b"LTRIM", key, start.as_bytes(), stop.as_bytes()])
                .await?,
        )
    }

    /// Returns how many members were added.
    pub async fn sadd(&self, key: &[u8], members: &[&[u8]]) -> Result<i64, PoolError> {
        let mut args: Vec<&[u8]> = Vec::with_capacity(members.len() + 2);
        args.push(b"SADD");
        args.push(key);
        args.extend_from_slice(members);
        expect_int(self.execute(key, &args).await?)
    }

    pub async fn smembers(&self, key: &[u8]) -> Result<Vec<Vec<u8>>, PoolError> {
        expect_bulk_list(self.execute(key, &[b"SMEMBERS", key]).await?)
    }

    /// Returns true if the member was newly added.
    pub async fn zadd(&self, key: &[u8], score: f64, member: &[u8]) -> Result<bool, PoolError> {
        let score = score.to_string();
        Ok(expect_int(self.execute(key, &[b"ZADD", key, score.as_bytes(), member]).await?)? == 1)
    }

    pub async fn zrange_with_scores(
        &self,
        key: &[u8],
        start: i64,
        stop: i64,
    ) -> Result<Vec<(Vec<u8>, f64)>, PoolError> {
        let (start, stop) = (start.to_string(), stop.to_string());
        let items = expect_bulk_list(
            self.execute(
                key,
                &[b"ZRANGE", key, start.as_bytes(), stop.as_bytes(), b"WITHSCORES"],
            )
            .await?,
        )?;
        pairs(items)
            .into_iter()
            .map(|(member, score)| {
                let score = std::str::from_utf8(&score)
                    .ok()
                    .and_then(|s| s.parse::<f64>().ok())
                    .ok_or_else(|| PoolError::UnexpectedResponse("non-numeric score".to_string()))?;
                Ok((member, score))
            })
            .collect()
    }

    /// Values for `keys`, in the order given.
    pub async fn mget(&self, keys: &[&[u8]]) -> Result<Vec<Option<Vec<u8>>>, PoolError> {
        self.on_current(|pool| mget_on(pool, keys)).await
    }

    /// Set every pair. Not atomic across nodes.
    pub async fn mset(&self, entries: &[(&[u8], &[u8])]) -> Result<(), PoolError> {
        self.on_current(|pool| mset_on(pool, entries)).await
    }
}

fn owner<'p, P: NodePool>(pool: &'p ActivePool<P>, key: &[u8]) -> Result<&'p Endpoint, PoolError> {
    pool.endpoint_for(key)
        .ok_or_else(|| PoolError::NotRegistered(pool.identity().to_string()))
}

async fn mget_on<P: NodePool>(
    pool: Arc<ActivePool<P>>,
    keys: &[&[u8]],
) -> Result<Vec<Option<Vec<u8>>>, PoolError> {
    let mut by_node: BTreeMap<Endpoint, Vec<usize>> = BTreeMap::new();
    for (index, key) in keys.iter().enumerate() {
        by_node.entry(owner::<P>(&pool, key)?.clone()).or_default().push(index);
    }

    let mut values = vec![None; keys.len()];
    for (endpoint, indexes) in by_node {
        let mut args: Vec<&[u8]> = Vec::with_capacity(indexes.len() + 1);
        args.push(b"MGET");
        args.extend(indexes.iter().map(|&i| keys[i]));

        let mut conn = pool.connection_on(&endpoint).await?;
        let replies = expect_array(conn.execute(&args).await?)?;
        if replies.len() != indexes.len() {
            return Err(PoolError::UnexpectedResponse(format!(
                "MGET on {} returned {} values for {} keys",
                endpoint,
                replies.len(),
                indexes.len()
            )));
        }
        for (index, reply) in indexes.into_iter().zip(replies) {
            values[index] = expect_bulk(reply)?;
        }
    }
    Ok(values)
}

async fn mset_on<P: NodePool>(
    pool: Arc<ActivePool<P>>,
    entries: &[(&[u8], &[u8])],
) -> Result<(), PoolError> {
    let mut by_node: BTreeMap<Endpoint, Vec<&[u8]>> = BTreeMap::new();
    for &(key, value) in entries {
        let args = by_node
            .entry(owner::<P>(&pool, key)?.clone())
            .or_insert_with(|| vec![&b"MSET"[..]]);
        args.push(key);
        args.push(value);
    }

    for (endpoint, args) in by_node {
        let mut conn = pool.connection_on(&endpoint).await?;
        expect_ok(conn.execute(&args).await?)?;
    }
    Ok(())
}
