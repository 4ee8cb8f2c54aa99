//! Containerised Redis for store tests
//!
//! Starts `redis:7-alpine` through testcontainers. Tests using it need a
//! Docker daemon and are marked `#[ignore]` so they only run on request.

use redis::Client;
use std::time::Duration;
use testcontainers::{
    core::{ContainerPort, WaitFor},
    runners::AsyncRunner,
    ContainerAsync, GenericImage,
};

/// Redis test environment with a containerised Redis instance
pub struct RedisTestEnv {
    _container: ContainerAsync<GenericImage>,
    pub client: Client,
    pub host: String,
    pub port: u16,
}

impl RedisTestEnv {
    /// Start a new Redis container
    ///
    /// # Errors
    /// Returns error if the container fails to start or the client cannot
    /// connect
    pub async fn start() -> Result<Self, Box<dyn std::error::Error>> {
        let container = GenericImage::new("redis", "7-alpine")
            .with_exposed_port(ContainerPort::Tcp(6379))
            .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"))
            .start()
            .await?;

        let host = container.get_host().await?.to_string();
        let port = container.get_host_port_ipv4(6379).await?;

        let client = Client::open(format!("redis://{}:{}", host, port).as_str())?;

        for _ in 0..5 {
            match client.get_multiplexed_tokio_connection().await {
                Ok(_) => break,
                Err(_) => tokio::time::sleep(Duration::from_millis(200)).await,
            }
        }

        Ok(Self {
            _container: container,
            client,
            host,
            port,
        })
    }

    /// Store URL for database `db`
    pub fn url(&self, db: u8) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, db)
    }

    /// Get an async Redis connection
    pub async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_tokio_connection().await
    }

    /// Flush all keys from all databases
    pub async fn flush_all(&self) -> Result<(), redis::RedisError> {
        let mut conn = self.connection().await?;
        redis::cmd("FLUSHALL").query_async::<()>(&mut conn).await
    }
}
