use std::time::Duration;

use seenmark_domain::ports::BoxFuture;
use seenmark_domain::ports::db::{DbAdapter, DbError};
use surrealdb::Surreal;
use surrealdb::engine::remote::ws::{Client, Ws};
use surrealdb::opt::auth::Root;
use tokio::net::TcpStream;
use tokio::time::timeout;
use url::Url;

use crate::config::AppConfig;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub endpoint: String,
    pub namespace: String,
    pub database: String,
    pub username: String,
    pub password: String,
}

impl DbConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            endpoint: config.surreal_endpoint.clone(),
            namespace: config.surreal_ns.clone(),
            database: config.surreal_db.clone(),
            username: config.surreal_user.clone(),
            password: config.surreal_pass.clone(),
        }
    }
}

/// Opens an authenticated websocket client scoped to the configured
/// namespace and database.
pub async fn connect_surreal(db_config: &DbConfig) -> anyhow::Result<Surreal<Client>> {
    let db = Surreal::<Client>::init();
    db.connect::<Ws>(&db_config.endpoint).await?;
    db.signin(Root {
        username: db_config.username.clone(),
        password: db_config.password.clone(),
    })
    .await?;
    db.use_ns(&db_config.namespace)
        .use_db(&db_config.database)
        .await?;
    tracing::info!(
        endpoint = %db_config.endpoint,
        namespace = %db_config.namespace,
        database = %db_config.database,
        "connected to surreal"
    );
    Ok(db)
}

#[derive(Debug, Clone)]
pub struct SurrealAdapter {
    config: DbConfig,
}

impl SurrealAdapter {
    pub fn new(config: DbConfig) -> Self {
        Self { config }
    }
}

impl DbAdapter for SurrealAdapter {
    fn name(&self) -> &'static str {
        "surrealdb"
    }

    fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    fn health_check(&self) -> BoxFuture<'_, Result<(), DbError>> {
        let endpoint = self.config.endpoint.clone();
        Box::pin(async move {
            let address = socket_address(&endpoint)?;
            timeout(CONNECT_TIMEOUT, TcpStream::connect(&address))
                .await
                .map_err(|_| DbError::Unavailable(format!("connect to {address} timed out")))?
                .map_err(|err| DbError::Unavailable(format!("connect to {address} failed: {err}")))?;
            tracing::debug!(endpoint, address, "surreal health check succeeded");
            Ok(())
        })
    }
}

fn socket_address(endpoint: &str) -> Result<String, DbError> {
    let normalized = if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("ws://{endpoint}")
    };
    let parsed = Url::parse(&normalized)
        .map_err(|err| DbError::Unavailable(format!("invalid endpoint '{endpoint}': {err}")))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| DbError::Unavailable(format!("missing host in endpoint '{endpoint}'")))?;
    let port = match (parsed.port(), parsed.scheme()) {
        (Some(port), _) => port,
        (None, "wss" | "https") => 443,
        (None, _) => 8000,
    };
    Ok(format!("{host}:{port}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_address_defaults_surreal_port() {
        assert_eq!(socket_address("ws://db.internal").unwrap(), "db.internal:8000");
        assert_eq!(socket_address("127.0.0.1:8001").unwrap(), "127.0.0.1:8001");
        assert_eq!(socket_address("wss://db.example.com").unwrap(), "db.example.com:443");
    }

    #[test]
    fn socket_address_rejects_garbage() {
        assert!(matches!(
            socket_address("ws://"),
            Err(DbError::Unavailable(_))
        ));
    }
}
