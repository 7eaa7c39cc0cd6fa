use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::DomainResult;
use crate::ports::seen::SeenLedgerStore;
use crate::util::require_id;

/// Identity of one ledger. A user has at most one ledger per story within a
/// tenant.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeenLedgerKey {
    pub tenant_id: String,
    pub story_id: String,
    pub user_id: String,
}

impl SeenLedgerKey {
    pub fn new(
        tenant_id: impl Into<String>,
        story_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            story_id: story_id.into(),
            user_id: user_id.into(),
        }
    }

    pub fn validated(tenant_id: &str, story_id: &str, user_id: &str) -> DomainResult<Self> {
        Ok(Self {
            tenant_id: require_id("tenant_id", tenant_id)?,
            story_id: require_id("story_id", story_id)?,
            user_id: require_id("user_id", user_id)?,
        })
    }
}

/// Per-(tenant, story, user) record of the comments a user has viewed.
///
/// `comments` maps a comment id to the epoch-ms at which it was last marked
/// seen. Entries are overwritten on re-marking and never removed here.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SeenLedger {
    pub ledger_id: String,
    pub tenant_id: String,
    pub story_id: String,
    pub user_id: String,
    pub last_seen_at_ms: i64,
    pub comments: BTreeMap<String, i64>,
}

impl SeenLedger {
    pub fn new(key: &SeenLedgerKey, ledger_id: impl Into<String>) -> Self {
        Self {
            ledger_id: ledger_id.into(),
            tenant_id: key.tenant_id.clone(),
            story_id: key.story_id.clone(),
            user_id: key.user_id.clone(),
            last_seen_at_ms: 0,
            comments: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> SeenLedgerKey {
        SeenLedgerKey::new(&self.tenant_id, &self.story_id, &self.user_id)
    }

    pub fn has_seen(&self, comment_id: &str) -> bool {
        self.comments.contains_key(comment_id)
    }

    pub fn seen_at(&self, comment_id: &str) -> Option<i64> {
        self.comments.get(comment_id).copied()
    }

    /// Applies one merge to this ledger and returns the number of marks
    /// written. Stores that merge in process go through here so the entry
    /// semantics stay identical across adapters.
    pub fn apply_marks(&mut self, comment_ids: &BTreeSet<String>, now_ms: i64) -> usize {
        self.last_seen_at_ms = now_ms;
        for comment_id in comment_ids {
            self.comments.insert(comment_id.clone(), now_ms);
        }
        comment_ids.len()
    }
}

/// Lookup input as issued by the read path: one story/user pair inside the
/// tenant being served.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SeenLedgerQuery {
    pub story_id: String,
    pub user_id: String,
}

#[derive(Clone)]
pub struct SeenLedgerService {
    store: Arc<dyn SeenLedgerStore>,
}

impl SeenLedgerService {
    pub fn new(store: Arc<dyn SeenLedgerStore>) -> Self {
        Self { store }
    }

    pub async fn find(
        &self,
        tenant_id: &str,
        story_id: &str,
        user_id: &str,
    ) -> DomainResult<Option<SeenLedger>> {
        let key = SeenLedgerKey::validated(tenant_id, story_id, user_id)?;
        self.store.find(&key).await
    }

    /// Resolves a batch of lookups in input order. Repeated queries reach the
    /// store once.
    pub async fn find_many(
        &self,
        tenant_id: &str,
        queries: &[SeenLedgerQuery],
    ) -> DomainResult<Vec<Option<SeenLedger>>> {
        let mut resolved: HashMap<SeenLedgerKey, Option<SeenLedger>> = HashMap::new();
        let mut ordered = Vec::with_capacity(queries.len());
        for query in queries {
            let key = SeenLedgerKey::validated(tenant_id, &query.story_id, &query.user_id)?;
            if !resolved.contains_key(&key) {
                let ledger = self.store.find(&key).await?;
                resolved.insert(key.clone(), ledger);
            }
            ordered.push(key);
        }
        Ok(ordered
            .into_iter()
            .map(|key| resolved.get(&key).cloned().flatten())
            .collect())
    }

    pub async fn seen_status(
        &self,
        tenant_id: &str,
        story_id: &str,
        user_id: &str,
        comment_ids: &[String],
    ) -> DomainResult<BTreeMap<String, bool>> {
        let ledger = self.find(tenant_id, story_id, user_id).await?;
        Ok(comment_ids
            .iter()
            .map(|comment_id| {
                let seen = ledger
                    .as_ref()
                    .is_some_and(|ledger| ledger.has_seen(comment_id));
                (comment_id.clone(), seen)
            })
            .collect())
    }

    /// Unbatched merge for callers that need the mark persisted before they
    /// respond.
    pub async fn mark_seen(
        &self,
        tenant_id: &str,
        story_id: &str,
        user_id: &str,
        comment_ids: impl IntoIterator<Item = String>,
        now_ms: i64,
    ) -> DomainResult<usize> {
        let key = SeenLedgerKey::validated(tenant_id, story_id, user_id)?;
        let comment_ids = normalize_comment_ids(comment_ids);
        if comment_ids.is_empty() {
            return Ok(0);
        }
        self.store.merge_seen(&key, &comment_ids, now_ms).await
    }
}

pub(crate) fn normalize_comment_ids(
    comment_ids: impl IntoIterator<Item = String>,
) -> BTreeSet<String> {
    comment_ids
        .into_iter()
        .filter(|comment_id| !comment_id.trim().is_empty())
        .collect()
}
