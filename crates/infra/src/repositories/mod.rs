mod seen;

pub use seen::{InMemorySeenLedgerStore, SurrealSeenLedgerStore};
