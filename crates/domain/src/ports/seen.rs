use std::collections::BTreeSet;

use crate::DomainResult;
use crate::ports::BoxFuture;
use crate::seen::{SeenLedger, SeenLedgerKey};

/// Persistence port for seen-comment ledgers.
///
/// `merge_seen` must be a single atomic insert-or-update on the ledger
/// addressed by `key`: `ledger_id` is written only when the ledger is
/// created, `last_seen_at` is always set to `now_ms`, and every id in
/// `comment_ids` is set to `now_ms` without replacing other entries of the
/// `comments` map. It returns the number of ids applied, or `Ok(0)` when the
/// store did not acknowledge the write.
#[allow(clippy::needless_pass_by_value)]
pub trait SeenLedgerStore: Send + Sync {
    fn find(&self, key: &SeenLedgerKey) -> BoxFuture<'_, DomainResult<Option<SeenLedger>>>;

    fn merge_seen(
        &self,
        key: &SeenLedgerKey,
        comment_ids: &BTreeSet<String>,
        now_ms: i64,
    ) -> BoxFuture<'_, DomainResult<usize>>;
}
