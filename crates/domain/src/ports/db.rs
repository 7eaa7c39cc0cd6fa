use thiserror::Error;

use super::BoxFuture;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("db unavailable: {0}")]
    Unavailable(String),
    #[error("db operation failed: {0}")]
    Operation(String),
}

/// Liveness check for the backing document store, run before the worker
/// starts accepting marks.
pub trait DbAdapter: Send + Sync {
    fn name(&self) -> &'static str;
    fn endpoint(&self) -> &str;
    fn health_check(&self) -> BoxFuture<'_, Result<(), DbError>>;
}
