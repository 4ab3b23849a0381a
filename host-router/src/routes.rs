use std::collections::HashSet;

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use crate::config::RedisEndpoint;
use crate::error::BoxError;

/// Point-in-time capture of a host's backend mapping as stored in the
/// routes backend. `id` is a stable version tag for the mapping and `dead`
/// holds indices into `backends` currently considered unreachable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteSnapshot {
    pub id: String,
    pub backends: Vec<String>,
    pub dead: HashSet<usize>,
}

/// Persistent host -> backend mapping consulted by the resolver.
///
/// `mark_dead` is advisory: the authoritative dead set lives behind this
/// trait and is re-read on every snapshot refresh.
#[async_trait]
pub trait RoutesBackend: Send + Sync {
    async fn backends(&self, host: &str) -> Result<RouteSnapshot, BoxError>;

    async fn mark_dead(
        &self,
        host: &str,
        backend: &str,
        index: usize,
        len: usize,
        ttl_secs: u64,
    ) -> Result<(), BoxError>;
}

/// Redis-backed route mappings.
///
/// `frontend:<host>` is a list whose first element is the mapping id and
/// whose remaining elements are backend URLs in ring order. `dead:<host>`
/// is a set of decimal indices with a TTL applied on every mark.
pub struct RedisBackend {
    read: ConnectionManager,
    write: ConnectionManager,
}

impl RedisBackend {
    pub async fn connect(
        read: &RedisEndpoint,
        write: &RedisEndpoint,
    ) -> Result<Self, redis::RedisError> {
        let read_client = redis::Client::open(read.url())?;
        let write_client = redis::Client::open(write.url())?;
        Ok(Self {
            read: read_client.get_connection_manager().await?,
            write: write_client.get_connection_manager().await?,
        })
    }
}

#[async_trait]
impl RoutesBackend for RedisBackend {
    async fn backends(&self, host: &str) -> Result<RouteSnapshot, BoxError> {
        let mut conn = self.read.clone();
        let (items, dead): (Vec<String>, Vec<String>) = redis::pipe()
            .lrange(format!("frontend:{host}"), 0, -1)
            .smembers(format!("dead:{host}"))
            .query_async(&mut conn)
            .await?;
        Ok(snapshot_from_parts(items, &dead))
    }

    async fn mark_dead(
        &self,
        host: &str,
        _backend: &str,
        index: usize,
        _len: usize,
        ttl_secs: u64,
    ) -> Result<(), BoxError> {
        let mut conn = self.write.clone();
        let key = format!("dead:{host}");
        let _: () = redis::pipe()
            .atomic()
            .sadd(&key, index)
            .expire(&key, ttl_secs as i64)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

fn snapshot_from_parts(mut items: Vec<String>, dead_members: &[String]) -> RouteSnapshot {
    let id = if items.is_empty() {
        String::new()
    } else {
        items.remove(0)
    };
    let dead = dead_members
        .iter()
        .filter_map(|member| member.parse().ok())
        .collect();
    RouteSnapshot {
        id,
        backends: items,
        dead,
    }
}
