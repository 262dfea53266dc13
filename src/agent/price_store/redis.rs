use {
    super::PriceHash,
    anyhow::{
        Context,
        Result,
        bail,
    },
    redis::{
        Client,
        ConnectionAddr,
        ConnectionInfo,
        RedisConnectionInfo,
        aio::ConnectionManager,
    },
    serde::Deserialize,
    tokio::sync::OnceCell,
};

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// `host:port` of the Redis server
    pub addr:     String,
    pub username: String,
    pub password: String,
    pub db:       i64,
}

const DEFAULT_PORT: u16 = 6379;

impl Config {
    /// Credentials are passed through as given, never parsed out of a URL.
    fn connection_info(&self) -> Result<ConnectionInfo> {
        let (host, port) = match self.addr.rsplit_once(':') {
            // Bare IPv6 addresses carry colons of their own.
            Some((host, port)) if !port.contains(']') && !host.ends_with(':') => (
                host,
                port.parse::<u16>()
                    .with_context(|| format!("invalid redis port in {:?}", self.addr))?,
            ),
            _ => (self.addr.as_str(), DEFAULT_PORT),
        };
        let host = host.trim_start_matches('[').trim_end_matches(']');

        Ok(ConnectionInfo {
            addr:  ConnectionAddr::Tcp(host.to_string(), port),
            redis: RedisConnectionInfo {
                db:       self.db,
                username: Some(self.username.clone()).filter(|username| !username.is_empty()),
                password: Some(self.password.clone()).filter(|password| !password.is_empty()),
            },
        })
    }
}

/// Redis-backed hash. The connection is established on first use and re-established
/// transparently by the connection manager afterwards.
pub struct RedisHash {
    client:     Client,
    connection: OnceCell<ConnectionManager>,
}

impl RedisHash {
    pub fn new(config: &Config) -> Result<Self> {
        if config.addr.is_empty() {
            bail!("redis address is empty");
        }

        let client =
            Client::open(config.connection_info()?).context("invalid redis configuration")?;
        Ok(Self {
            client,
            connection: OnceCell::new(),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        let connection = self
            .connection
            .get_or_try_init(|| self.client.get_connection_manager())
            .await
            .context("failed to connect to redis")?;
        Ok(connection.clone())
    }
}

#[async_trait::async_trait]
impl PriceHash for RedisHash {
    async fn set_fields(&self, hash: &str, fields: Vec<(String, String)>) -> Result<()> {
        let mut connection = self.connection().await?;
        redis::cmd("HSET")
            .arg(hash)
            .arg(fields)
            .query_async::<_, ()>(&mut connection)
            .await
            .context("redis HSET error")
    }

    async fn get_fields(&self, hash: &str, fields: Vec<String>) -> Result<Vec<Option<String>>> {
        let mut connection = self.connection().await?;
        redis::cmd("HMGET")
            .arg(hash)
            .arg(fields)
            .query_async::<_, Vec<Option<String>>>(&mut connection)
            .await
            .context("redis HMGET error")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(addr: &str) -> Config {
        Config {
            addr: addr.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_connection_info_splits_address() {
        let info = config("localhost:6380").connection_info().unwrap();
        assert_eq!(info.addr, ConnectionAddr::Tcp("localhost".to_string(), 6380));
        assert_eq!(info.redis.db, 0);
        assert!(info.redis.username.is_none());
        assert!(info.redis.password.is_none());

        let info = config("redis.internal").connection_info().unwrap();
        assert_eq!(
            info.addr,
            ConnectionAddr::Tcp("redis.internal".to_string(), 6379)
        );

        let info = config("[::1]:6390").connection_info().unwrap();
        assert_eq!(info.addr, ConnectionAddr::Tcp("::1".to_string(), 6390));

        assert!(config("localhost:port").connection_info().is_err());
    }

    #[test]
    fn test_credentials_are_passed_verbatim() {
        let config = Config {
            username: "bridge:ro".to_string(),
            password: "p@ss/w#rd".to_string(),
            db: 2,
            ..config("localhost:6379")
        };

        let info = config.connection_info().unwrap();
        assert_eq!(info.redis.db, 2);
        assert_eq!(info.redis.username.as_deref(), Some("bridge:ro"));
        assert_eq!(info.redis.password.as_deref(), Some("p@ss/w#rd"));

        assert!(RedisHash::new(&config).is_ok());
    }

    #[test]
    fn test_new_rejects_empty_address() {
        let err = RedisHash::new(&Config::default()).err().unwrap();
        assert_eq!(err.to_string(), "redis address is empty");
    }
}
