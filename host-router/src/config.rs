use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisEndpoint {
    pub host: String,
    pub port: u16,
}

impl RedisEndpoint {
    pub fn url(&self) -> String {
        format!("redis://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub listen_addr: SocketAddr,
    pub read_redis: RedisEndpoint,
    pub write_redis: RedisEndpoint,
    /// Access log destination; the literal `none` disables the sink.
    pub log_path: String,
    pub dial_timeout: Duration,
    /// Zero disables the per-request timeout.
    pub request_timeout: Duration,
    pub dead_backend_ttl: u64,
    pub flush_interval: Duration,
    /// Empty disables request-id injection.
    pub request_id_header: String,
    pub disable_dead_marking: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        let read_redis = RedisEndpoint {
            host: "127.0.0.1".to_string(),
            port: 6379,
        };
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8989)),
            write_redis: read_redis.clone(),
            read_redis,
            log_path: "./access.log".to_string(),
            dial_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            dead_backend_ttl: 30,
            flush_interval: Duration::ZERO,
            request_id_header: String::new(),
            disable_dead_marking: false,
        }
    }
}

impl RouterConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let listen_addr = match env::var("LISTEN_ADDR") {
            Ok(value) => value
                .parse::<SocketAddr>()
                .context("LISTEN_ADDR must be in host:port format")?,
            Err(_) => defaults.listen_addr,
        };

        let read_redis = RedisEndpoint {
            host: env::var("READ_REDIS_HOST").unwrap_or(defaults.read_redis.host),
            port: env_optional_u16("READ_REDIS_PORT")?.unwrap_or(defaults.read_redis.port),
        };
        let write_redis = RedisEndpoint {
            host: env::var("WRITE_REDIS_HOST").unwrap_or_else(|_| read_redis.host.clone()),
            port: env_optional_u16("WRITE_REDIS_PORT")?.unwrap_or(read_redis.port),
        };

        let dial_timeout = env_optional_u64("DIAL_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.dial_timeout);
        let request_timeout = env_optional_u64("REQUEST_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.request_timeout);
        let flush_interval = env_optional_u64("FLUSH_INTERVAL_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.flush_interval);

        Ok(Self {
            listen_addr,
            read_redis,
            write_redis,
            log_path: env::var("LOG_PATH").unwrap_or(defaults.log_path),
            dial_timeout,
            request_timeout,
            dead_backend_ttl: env_optional_u64("DEAD_BACKEND_TTL_SECS")?
                .unwrap_or(defaults.dead_backend_ttl),
            flush_interval,
            request_id_header: env::var("REQUEST_ID_HEADER").unwrap_or_default(),
            disable_dead_marking: env_bool("DISABLE_DEAD_MARKING", false),
        })
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes"
        ),
        Err(_) => default,
    }
}

fn env_optional_u16(name: &str) -> anyhow::Result<Option<u16>> {
    match env::var(name) {
        Ok(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            let parsed = trimmed
                .parse::<u16>()
                .with_context(|| format!("{name} must be a port number"))?;
            Ok(Some(parsed))
        }
        Err(_) => Ok(None),
    }
}

fn env_optional_u64(name: &str) -> anyhow::Result<Option<u64>> {
    match env::var(name) {
        Ok(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            let parsed = trimmed
                .parse::<u64>()
                .with_context(|| format!("{name} must be a non-negative integer"))?;
            Ok(Some(parsed))
        }
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, MutexGuard};

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    struct EnvGuard<'a> {
        _lock: MutexGuard<'a, ()>,
        saved: Vec<(&'static str, Option<String>)>,
    }

    impl<'a> EnvGuard<'a> {
        fn new(keys: &[&'static str]) -> Self {
            let lock = ENV_LOCK.lock().unwrap();
            let saved = keys.iter().map(|key| (*key, env::var(key).ok())).collect();
            for key in keys {
                env::remove_var(key);
            }
            Self { _lock: lock, saved }
        }
    }

    impl Drop for EnvGuard<'_> {
        fn drop(&mut self) {
            for (key, value) in self.saved.drain(..) {
                match value {
                    Some(value) => env::set_var(key, value),
                    None => env::remove_var(key),
                }
            }
        }
    }

    const ALL_KEYS: &[&str] = &[
        "LISTEN_ADDR",
        "READ_REDIS_HOST",
        "READ_REDIS_PORT",
        "WRITE_REDIS_HOST",
        "WRITE_REDIS_PORT",
        "LOG_PATH",
        "DIAL_TIMEOUT_SECS",
        "REQUEST_TIMEOUT_SECS",
        "DEAD_BACKEND_TTL_SECS",
        "FLUSH_INTERVAL_MS",
        "REQUEST_ID_HEADER",
        "DISABLE_DEAD_MARKING",
    ];

    #[test]
    fn from_env_applies_defaults() {
        let _guard = EnvGuard::new(ALL_KEYS);

        let config = RouterConfig::from_env().unwrap();
        assert_eq!(config.listen_addr, SocketAddr::from(([0, 0, 0, 0], 8989)));
        assert_eq!(config.read_redis.url(), "redis://127.0.0.1:6379");
        assert_eq!(config.write_redis, config.read_redis);
        assert_eq!(config.log_path, "./access.log");
        assert_eq!(config.dial_timeout, Duration::from_secs(10));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.dead_backend_ttl, 30);
        assert_eq!(config.flush_interval, Duration::ZERO);
        assert!(config.request_id_header.is_empty());
        assert!(!config.disable_dead_marking);
    }

    #[test]
    fn from_env_reads_config() {
        let _guard = EnvGuard::new(ALL_KEYS);

        env::set_var("LISTEN_ADDR", "127.0.0.1:9090");
        env::set_var("READ_REDIS_HOST", "redis-read.internal");
        env::set_var("READ_REDIS_PORT", "6380");
        env::set_var("WRITE_REDIS_HOST", "redis-write.internal");
        env::set_var("LOG_PATH", "none");
        env::set_var("DIAL_TIMEOUT_SECS", "3");
        env::set_var("REQUEST_TIMEOUT_SECS", "0");
        env::set_var("DEAD_BACKEND_TTL_SECS", "60");
        env::set_var("FLUSH_INTERVAL_MS", "250");
        env::set_var("REQUEST_ID_HEADER", "X-Request-Id");
        env::set_var("DISABLE_DEAD_MARKING", "yes");

        let config = RouterConfig::from_env().unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9090".parse().unwrap());
        assert_eq!(config.read_redis.host, "redis-read.internal");
        assert_eq!(config.read_redis.port, 6380);
        // The write side inherits the read port when only the host is set.
        assert_eq!(config.write_redis.host, "redis-write.internal");
        assert_eq!(config.write_redis.port, 6380);
        assert_eq!(config.log_path, "none");
        assert_eq!(config.dial_timeout, Duration::from_secs(3));
        assert_eq!(config.request_timeout, Duration::ZERO);
        assert_eq!(config.dead_backend_ttl, 60);
        assert_eq!(config.flush_interval, Duration::from_millis(250));
        assert_eq!(config.request_id_header, "X-Request-Id");
        assert!(config.disable_dead_marking);
    }

    #[test]
    fn from_env_rejects_bad_values() {
        let _guard = EnvGuard::new(ALL_KEYS);

        env::set_var("READ_REDIS_PORT", "not-a-port");
        assert!(RouterConfig::from_env().is_err());
    }
}
