pub mod error;
pub mod ports;
pub mod seen;
pub mod seen_batch;
pub mod util;

pub type DomainResult<T> = Result<T, error::DomainError>;
