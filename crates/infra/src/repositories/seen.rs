use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use seenmark_domain::DomainResult;
use seenmark_domain::error::DomainError;
use seenmark_domain::ports::BoxFuture;
use seenmark_domain::ports::seen::SeenLedgerStore;
use seenmark_domain::seen::{SeenLedger, SeenLedgerKey};
use seenmark_domain::util::{format_ms_rfc3339, parse_rfc3339_ms, uuid_v7_without_dashes};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json, to_value};
use surrealdb::Surreal;
use surrealdb::engine::remote::ws::Client;
use tokio::sync::RwLock;
use tokio::time::sleep;

use crate::db::{DbConfig, connect_surreal};

/// Process-local ledger store. Each merge runs entirely under the write lock,
/// which gives the same union semantics as a path-level upsert.
#[derive(Clone, Default)]
pub struct InMemorySeenLedgerStore {
    ledgers: Arc<RwLock<HashMap<SeenLedgerKey, SeenLedger>>>,
}

impl InMemorySeenLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn ledger_count(&self) -> usize {
        self.ledgers.read().await.len()
    }
}

impl SeenLedgerStore for InMemorySeenLedgerStore {
    fn find(&self, key: &SeenLedgerKey) -> BoxFuture<'_, DomainResult<Option<SeenLedger>>> {
        let key = key.clone();
        let ledgers = self.ledgers.clone();
        Box::pin(async move { Ok(ledgers.read().await.get(&key).cloned()) })
    }

    fn merge_seen(
        &self,
        key: &SeenLedgerKey,
        comment_ids: &BTreeSet<String>,
        now_ms: i64,
    ) -> BoxFuture<'_, DomainResult<usize>> {
        let key = key.clone();
        let comment_ids = comment_ids.clone();
        let ledgers = self.ledgers.clone();
        Box::pin(async move {
            if comment_ids.is_empty() {
                return Ok(0);
            }
            let mut ledgers = ledgers.write().await;
            let ledger = ledgers
                .entry(key.clone())
                .or_insert_with(|| SeenLedger::new(&key, uuid_v7_without_dashes()));
            Ok(ledger.apply_marks(&comment_ids, now_ms))
        })
    }
}

const MERGE_RETRY_MAX_ATTEMPTS: u32 = 4;
const MERGE_RETRY_BACKOFF_BASE: Duration = Duration::from_millis(20);
const MERGE_RETRY_BACKOFF_MAX: Duration = Duration::from_millis(250);

const SEEN_LEDGER_PROJECTION: &str = "ledger_id, tenant_id, story_id, user_id, comments, \
     type::string(last_seen_at) AS last_seen_at";

/// Ledgers live in the `seen_comments` table under the record id
/// `[tenant_id, story_id, user_id]`, so the composite key is unique by
/// construction. `MERGE` sets each `comments` entry without replacing the
/// rest of the map.
#[derive(Clone)]
pub struct SurrealSeenLedgerStore {
    client: Arc<Surreal<Client>>,
}

impl SurrealSeenLedgerStore {
    pub async fn new(db_config: &DbConfig) -> anyhow::Result<Self> {
        let db = connect_surreal(db_config).await?;
        Ok(Self {
            client: Arc::new(db),
        })
    }

    fn record_key(key: &SeenLedgerKey) -> Value {
        json!([key.tenant_id, key.story_id, key.user_id])
    }

    fn map_surreal_error(err: surrealdb::Error) -> DomainError {
        let error_message = err.to_string().to_lowercase();
        if error_message.contains("already exists")
            || error_message.contains("duplicate")
            || error_message.contains("unique")
            || error_message.contains("conflict")
        {
            return DomainError::Conflict;
        }
        if error_message.contains("connection")
            || error_message.contains("timed out")
            || error_message.contains("not connected")
            || error_message.contains("websocket")
        {
            return DomainError::Unavailable(error_message);
        }
        DomainError::Validation(format!("surreal query failed: {error_message}"))
    }

    fn build_merge_payload(
        key: &SeenLedgerKey,
        comment_ids: &BTreeSet<String>,
        now_ms: i64,
    ) -> SurrealSeenMergeRow {
        let seen_at = format_ms_rfc3339(now_ms);
        SurrealSeenMergeRow {
            tenant_id: key.tenant_id.clone(),
            story_id: key.story_id.clone(),
            user_id: key.user_id.clone(),
            comments: comment_ids
                .iter()
                .map(|comment_id| (comment_id.clone(), seen_at.clone()))
                .collect(),
            last_seen_at: seen_at,
        }
    }

    fn map_row(row: SurrealSeenLedgerRow) -> DomainResult<SeenLedger> {
        let comments = row
            .comments
            .into_iter()
            .map(|(comment_id, seen_at)| Ok((comment_id, parse_rfc3339_ms(&seen_at)?)))
            .collect::<DomainResult<BTreeMap<_, _>>>()?;
        Ok(SeenLedger {
            ledger_id: row.ledger_id,
            tenant_id: row.tenant_id,
            story_id: row.story_id,
            user_id: row.user_id,
            last_seen_at_ms: parse_rfc3339_ms(&row.last_seen_at)?,
            comments,
        })
    }

    async fn run_merge(
        client: &Surreal<Client>,
        ledger_key: &Value,
        payload: &Value,
    ) -> surrealdb::Result<Vec<Value>> {
        let mut response = client
            .query(format!(
                "BEGIN TRANSACTION;\n\
                 UPSERT type::record('seen_comments', $ledger_key) MERGE {{\n\
                    tenant_id: $payload.tenant_id,\n\
                    story_id: $payload.story_id,\n\
                    user_id: $payload.user_id,\n\
                    comments: $payload.comments,\n\
                    last_seen_at: <datetime>$payload.last_seen_at\n\
                 }} RETURN NONE;\n\
                 UPDATE type::record('seen_comments', $ledger_key) \
                    SET ledger_id = ledger_id ?? $ledger_id RETURN NONE;\n\
                 SELECT {SEEN_LEDGER_PROJECTION} \
                    FROM type::record('seen_comments', $ledger_key);\n\
                 COMMIT TRANSACTION;"
            ))
            .bind(("ledger_key", ledger_key.clone()))
            .bind(("ledger_id", uuid_v7_without_dashes()))
            .bind(("payload", payload.clone()))
            .await?
            .check()?;
        response.take(2)
    }

    fn decode_rows(rows: Vec<Value>) -> DomainResult<Vec<SeenLedger>> {
        rows.into_iter()
            .map(|row| {
                serde_json::from_value::<SurrealSeenLedgerRow>(row)
                    .map_err(|err| {
                        DomainError::Validation(format!("invalid seen_comments row: {err}"))
                    })
                    .and_then(Self::map_row)
            })
            .collect()
    }
}

#[derive(Debug, Serialize)]
struct SurrealSeenMergeRow {
    tenant_id: String,
    story_id: String,
    user_id: String,
    comments: BTreeMap<String, String>,
    last_seen_at: String,
}

#[derive(Debug, Deserialize)]
struct SurrealSeenLedgerRow {
    ledger_id: String,
    tenant_id: String,
    story_id: String,
    user_id: String,
    #[serde(default)]
    comments: BTreeMap<String, String>,
    last_seen_at: String,
}

impl SeenLedgerStore for SurrealSeenLedgerStore {
    fn find(&self, key: &SeenLedgerKey) -> BoxFuture<'_, DomainResult<Option<SeenLedger>>> {
        let ledger_key = Self::record_key(key);
        let client = self.client.clone();
        Box::pin(async move {
            let mut response = client
                .query(format!(
                    "SELECT {SEEN_LEDGER_PROJECTION} \
                     FROM type::record('seen_comments', $ledger_key)"
                ))
                .bind(("ledger_key", ledger_key))
                .await
                .map_err(Self::map_surreal_error)?;
            let rows: Vec<Value> = response
                .take(0)
                .map_err(|err| DomainError::Validation(format!("invalid query result: {err}")))?;
            Ok(Self::decode_rows(rows)?.into_iter().next())
        })
    }

    fn merge_seen(
        &self,
        key: &SeenLedgerKey,
        comment_ids: &BTreeSet<String>,
        now_ms: i64,
    ) -> BoxFuture<'_, DomainResult<usize>> {
        if comment_ids.is_empty() {
            return Box::pin(async move { Ok(0) });
        }
        let requested = comment_ids.len();
        let payload = Self::build_merge_payload(key, comment_ids, now_ms);
        let ledger_key = Self::record_key(key);
        let client = self.client.clone();
        Box::pin(async move {
            let payload = to_value(payload)
                .map_err(|err| DomainError::Validation(format!("invalid payload: {err}")))?;

            for attempt in 0..MERGE_RETRY_MAX_ATTEMPTS {
                match Self::run_merge(&client, &ledger_key, &payload).await {
                    Ok(rows) if rows.is_empty() => {
                        tracing::warn!("seen_comments merge returned no row");
                        return Ok(0);
                    }
                    Ok(_) => return Ok(requested),
                    Err(err)
                        if attempt + 1 < MERGE_RETRY_MAX_ATTEMPTS
                            && is_retryable_conflict(&err.to_string()) =>
                    {
                        tracing::debug!(attempt, error = %err, "seen_comments merge conflicted; retrying");
                        sleep(merge_backoff_for_attempt(attempt)).await;
                    }
                    Err(err) => return Err(Self::map_surreal_error(err)),
                }
            }
            Err(DomainError::Unavailable(
                "seen_comments merge retry loop exited unexpectedly".to_string(),
            ))
        })
    }
}

/// Optimistic transaction conflicts surface as commit failures that the
/// server marks retryable. Unique-index violations are not retried.
fn is_retryable_conflict(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("can be retried")
        || message.contains("transaction conflict")
        || message.contains("write conflict")
}

fn merge_backoff_for_attempt(attempt: u32) -> Duration {
    let multiplier = 1u64 << attempt.min(8);
    let base_ms = MERGE_RETRY_BACKOFF_BASE.as_millis() as u64;
    let max_ms = MERGE_RETRY_BACKOFF_MAX.as_millis() as u64;
    Duration::from_millis(base_ms.saturating_mul(multiplier).min(max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[tokio::test]
    async fn find_on_unknown_key_is_none() {
        let store = InMemorySeenLedgerStore::new();
        let found = store
            .find(&SeenLedgerKey::new("t", "s1", "u1"))
            .await
            .expect("find");
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn merge_creates_ledger_and_sets_last_seen_at() {
        let store = InMemorySeenLedgerStore::new();
        let key = SeenLedgerKey::new("t", "s1", "u1");

        let applied = store
            .merge_seen(&key, &ids(&["c1", "c2"]), 1_000)
            .await
            .expect("merge");

        assert_eq!(applied, 2);
        let ledger = store.find(&key).await.expect("find").expect("ledger");
        assert_eq!(ledger.last_seen_at_ms, 1_000);
        assert_eq!(ledger.seen_at("c1"), Some(1_000));
        assert!(!ledger.ledger_id.is_empty());
    }

    #[tokio::test]
    async fn remerge_keeps_ledger_id_and_latest_timestamp() {
        let store = InMemorySeenLedgerStore::new();
        let key = SeenLedgerKey::new("t", "s1", "u1");
        store.merge_seen(&key, &ids(&["c1"]), 1_000).await.expect("first");
        let first = store.find(&key).await.expect("find").expect("ledger");

        store.merge_seen(&key, &ids(&["c1"]), 2_000).await.expect("second");
        let second = store.find(&key).await.expect("find").expect("ledger");

        assert_eq!(first.ledger_id, second.ledger_id);
        assert_eq!(second.seen_at("c1"), Some(2_000));
        assert_eq!(second.last_seen_at_ms, 2_000);
        assert!(second.last_seen_at_ms >= first.last_seen_at_ms);
    }

    #[tokio::test]
    async fn empty_merge_does_not_create_a_ledger() {
        let store = InMemorySeenLedgerStore::new();
        let key = SeenLedgerKey::new("t", "s1", "u1");
        let applied = store
            .merge_seen(&key, &BTreeSet::new(), 1_000)
            .await
            .expect("merge");
        assert_eq!(applied, 0);
        assert_eq!(store.ledger_count().await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_disjoint_merges_keep_the_union() {
        let store = InMemorySeenLedgerStore::new();
        let key = SeenLedgerKey::new("t", "s1", "u1");

        let mut tasks = Vec::new();
        for writer in 0..8 {
            let store = store.clone();
            let key = key.clone();
            tasks.push(tokio::spawn(async move {
                let batch = (0..25)
                    .map(|index| format!("c-{writer}-{index}"))
                    .collect::<BTreeSet<_>>();
                store.merge_seen(&key, &batch, 1_000 + writer).await
            }));
        }
        for task in tasks {
            assert_eq!(task.await.expect("merge task").expect("merge"), 25);
        }

        assert_eq!(store.ledger_count().await, 1);
        let ledger = store.find(&key).await.expect("find").expect("ledger");
        assert_eq!(ledger.comments.len(), 200);
        let newest = ledger.comments.values().copied().max().unwrap_or_default();
        assert!(ledger.last_seen_at_ms >= 1_000);
        assert!(newest <= 1_007);
    }

    #[test]
    fn merge_payload_marks_every_comment_with_now() {
        let key = SeenLedgerKey::new("t", "s1", "u1");
        let payload =
            SurrealSeenLedgerStore::build_merge_payload(&key, &ids(&["c1", "c2"]), 1_739_750_400_000);
        assert_eq!(payload.comments.len(), 2);
        assert_eq!(payload.comments["c1"], payload.last_seen_at);
        assert_eq!(payload.last_seen_at, "2025-02-17T00:00:00Z");
    }

    #[test]
    fn record_key_is_tenant_story_user() {
        let key = SeenLedgerKey::new("t", "s1", "u1");
        assert_eq!(
            SurrealSeenLedgerStore::record_key(&key),
            json!(["t", "s1", "u1"])
        );
    }

    #[test]
    fn decode_rows_converts_timestamps() {
        let rows = vec![json!({
            "ledger_id": "0192a",
            "tenant_id": "t",
            "story_id": "s1",
            "user_id": "u1",
            "comments": { "c1": "2025-02-17T00:00:00Z" },
            "last_seen_at": "2025-02-17T00:00:01Z",
        })];
        let ledgers = SurrealSeenLedgerStore::decode_rows(rows).expect("decode");
        assert_eq!(ledgers.len(), 1);
        assert_eq!(ledgers[0].seen_at("c1"), Some(1_739_750_400_000));
        assert_eq!(ledgers[0].last_seen_at_ms, 1_739_750_401_000);
    }

    #[test]
    fn decode_rows_rejects_bad_timestamp() {
        let rows = vec![json!({
            "ledger_id": "0192a",
            "tenant_id": "t",
            "story_id": "s1",
            "user_id": "u1",
            "comments": { "c1": "yesterday" },
            "last_seen_at": "2025-02-17T00:00:01Z",
        })];
        assert!(matches!(
            SurrealSeenLedgerStore::decode_rows(rows),
            Err(DomainError::Validation(_))
        ));
    }

    #[test]
    fn commit_conflicts_are_retryable() {
        assert!(is_retryable_conflict(
            "The query was not executed due to a failed transaction. Failed to commit \
             transaction due to a read or write conflict. This transaction can be retried"
        ));
        assert!(is_retryable_conflict("Transaction conflict: resource is busy"));
    }

    #[test]
    fn unique_and_connection_errors_are_not_retried() {
        assert!(!is_retryable_conflict(
            "Database index `seen_key` already contains ['t', 's1', 'u1']"
        ));
        assert!(!is_retryable_conflict("Record seen_comments:1 already exists"));
        assert!(!is_retryable_conflict("connection reset by peer"));
        assert!(!is_retryable_conflict("Parse error: unexpected token"));
    }

    #[test]
    fn merge_backoff_doubles_up_to_the_cap() {
        assert_eq!(merge_backoff_for_attempt(0), Duration::from_millis(20));
        assert_eq!(merge_backoff_for_attempt(1), Duration::from_millis(40));
        assert_eq!(merge_backoff_for_attempt(2), Duration::from_millis(80));
        assert_eq!(merge_backoff_for_attempt(5), MERGE_RETRY_BACKOFF_MAX);
        assert_eq!(merge_backoff_for_attempt(40), MERGE_RETRY_BACKOFF_MAX);
    }
}
