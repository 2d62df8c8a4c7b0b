// SPDX-License-Identifier: MIT OR Apache-2.0
//! The persisted execution index.
//!
//! `logs/index.json` mirrors every execution's API-visible state: status,
//! tenancy, retry linkage, and idempotency keys. The server rebuilds its
//! in-memory maps from this file at startup, so restarts lose nothing.
//! Writes go through the atomic rename path shared by all stores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use spell_core::ErrorCode;
use spell_store::{atomic_write_json, read_json};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// API-visible lifecycle of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Accepted, not yet running.
    Queued,
    /// Steps are executing.
    Running,
    /// Terminal: success.
    Succeeded,
    /// Terminal: failed.
    Failed,
    /// Terminal: execution deadline exceeded.
    Timeout,
    /// Terminal: cancelled by the caller.
    Canceled,
}

impl ExecutionStatus {
    /// Whether this status is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Timeout | Self::Canceled)
    }

    /// Whether retry is permitted from this status.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed | Self::Timeout | Self::Canceled)
    }
}

/// Confirmations the caller sent with the submission.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Confirmation {
    /// Risk acknowledged.
    #[serde(default)]
    pub risk_acknowledged: bool,
    /// Billing acknowledged.
    #[serde(default)]
    pub billing_acknowledged: bool,
}

/// One execution's index entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Execution id; also the receipt file stem.
    pub execution_id: String,
    /// Button that produced this execution.
    pub button_id: String,
    /// Spell the button resolved to.
    pub spell_id: String,
    /// Pinned spell version, when the button pins one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spell_version: Option<String>,
    /// Owning tenant.
    pub tenant_id: String,
    /// Role the caller acted as.
    pub actor_role: String,
    /// Lifecycle status.
    pub status: ExecutionStatus,
    /// Stable error code for terminal failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    /// Single-line failure cause.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Submission time.
    pub created_at: DateTime<Utc>,
    /// Last state transition time.
    pub updated_at: DateTime<Utc>,
    /// Execution this one retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<String>,
    /// Execution that retried this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retried_by: Option<String>,
    /// Idempotency key the submission carried.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Whether this was a dry run.
    #[serde(default)]
    pub dry_run: bool,
    /// Merged input as submitted; replayed by retry.
    #[serde(default)]
    pub input: Map<String, Value>,
    /// Confirmations as submitted; replayed by retry.
    #[serde(default)]
    pub confirmation: Confirmation,
}

/// Idempotency mapping: key → first execution + body fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyEntry {
    /// Execution created by the first POST with this key.
    pub execution_id: String,
    /// SHA-256 hex of the canonical request body.
    pub body_hash: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexFile {
    #[serde(default)]
    executions: Vec<ExecutionRecord>,
    #[serde(default)]
    idempotency: std::collections::BTreeMap<String, IdempotencyEntry>,
}

/// Query filters for the list endpoint and SSE stream.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    /// Filter by status.
    pub status: Option<ExecutionStatus>,
    /// Filter by button.
    pub button_id: Option<String>,
    /// Filter by spell.
    pub spell_id: Option<String>,
    /// Filter by tenant.
    pub tenant_id: Option<String>,
    /// Only executions created at/after this instant.
    pub from: Option<DateTime<Utc>>,
    /// Only executions created at/before this instant.
    pub to: Option<DateTime<Utc>>,
    /// Cap on returned entries (newest first).
    pub limit: Option<usize>,
}

impl ListFilter {
    /// Whether `record` passes every set filter.
    #[must_use]
    pub fn matches(&self, record: &ExecutionRecord) -> bool {
        if let Some(status) = self.status {
            if record.status != status {
                return false;
            }
        }
        if let Some(button_id) = &self.button_id {
            if &record.button_id != button_id {
                return false;
            }
        }
        if let Some(spell_id) = &self.spell_id {
            if &record.spell_id != spell_id {
                return false;
            }
        }
        if let Some(tenant_id) = &self.tenant_id {
            if &record.tenant_id != tenant_id {
                return false;
            }
        }
        if let Some(from) = self.from {
            if record.created_at < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if record.created_at > to {
                return false;
            }
        }
        true
    }
}

/// The execution index, persisted to `logs/index.json`.
#[derive(Debug)]
pub struct ExecutionIndex {
    path: PathBuf,
    state: Mutex<IndexFile>,
}

impl ExecutionIndex {
    /// Open the index, rebuilding state from disk.
    pub fn open(path: PathBuf) -> anyhow::Result<Self> {
        let state: IndexFile = read_json(&path)?.unwrap_or_default();
        info!(
            executions = state.executions.len(),
            idempotency_keys = state.idempotency.len(),
            "execution index loaded"
        );
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Insert a new record and persist.
    pub async fn insert(&self, record: ExecutionRecord) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        state.executions.push(record);
        persist(&self.path, &state)
    }

    /// Apply `apply` to the record with `execution_id`, bump `updated_at`,
    /// persist, and return the updated record.
    pub async fn update(
        &self,
        execution_id: &str,
        apply: impl FnOnce(&mut ExecutionRecord),
    ) -> anyhow::Result<Option<ExecutionRecord>> {
        let mut state = self.state.lock().await;
        let Some(record) = state
            .executions
            .iter_mut()
            .find(|r| r.execution_id == execution_id)
        else {
            return Ok(None);
        };
        apply(record);
        record.updated_at = Utc::now();
        let updated = record.clone();
        persist(&self.path, &state)?;
        Ok(Some(updated))
    }

    /// Fetch one record.
    pub async fn get(&self, execution_id: &str) -> Option<ExecutionRecord> {
        self.state
            .lock()
            .await
            .executions
            .iter()
            .find(|r| r.execution_id == execution_id)
            .cloned()
    }

    /// List records matching `filter`, newest first.
    pub async fn list(&self, filter: &ListFilter) -> Vec<ExecutionRecord> {
        let state = self.state.lock().await;
        let mut out: Vec<ExecutionRecord> = state
            .executions
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        out
    }

    /// Count non-terminal executions, optionally for one tenant.
    pub async fn in_flight(&self, tenant_id: Option<&str>) -> usize {
        self.state
            .lock()
            .await
            .executions
            .iter()
            .filter(|r| !r.status.is_terminal())
            .filter(|r| tenant_id.is_none_or(|t| r.tenant_id == t))
            .count()
    }

    /// Count submissions for a tenant since `since`.
    pub async fn submissions_since(&self, tenant_id: &str, since: DateTime<Utc>) -> usize {
        self.state
            .lock()
            .await
            .executions
            .iter()
            .filter(|r| r.tenant_id == tenant_id && r.created_at >= since)
            .count()
    }

    /// Look up an idempotency key.
    pub async fn idempotency_get(&self, key: &str) -> Option<IdempotencyEntry> {
        self.state.lock().await.idempotency.get(key).cloned()
    }

    /// Record an idempotency mapping and persist.
    pub async fn idempotency_put(&self, key: &str, entry: IdempotencyEntry) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        state.idempotency.insert(key.to_string(), entry);
        persist(&self.path, &state)
    }

    /// Apply retention: keep at most `max_files` terminal executions and
    /// drop those older than `retention_days`, deleting their receipts.
    pub async fn prune(
        &self,
        logs_dir: &Path,
        max_files: Option<usize>,
        retention_days: Option<i64>,
    ) -> anyhow::Result<usize> {
        let mut state = self.state.lock().await;

        let mut drop_ids: Vec<String> = Vec::new();
        if let Some(days) = retention_days {
            let cutoff = Utc::now() - chrono::Duration::days(days);
            for record in &state.executions {
                if record.status.is_terminal() && record.updated_at < cutoff {
                    drop_ids.push(record.execution_id.clone());
                }
            }
        }
        if let Some(max) = max_files {
            let mut terminal: Vec<&ExecutionRecord> = state
                .executions
                .iter()
                .filter(|r| r.status.is_terminal() && !drop_ids.contains(&r.execution_id))
                .collect();
            terminal.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
            for record in terminal.into_iter().skip(max) {
                drop_ids.push(record.execution_id.clone());
            }
        }
        if drop_ids.is_empty() {
            return Ok(0);
        }

        for id in &drop_ids {
            let receipt = logs_dir.join(format!("{id}.json"));
            if let Err(e) = std::fs::remove_file(&receipt) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %receipt.display(), error = %e, "failed to prune receipt");
                }
            }
        }
        state
            .executions
            .retain(|r| !drop_ids.contains(&r.execution_id));
        state
            .idempotency
            .retain(|_, entry| !drop_ids.contains(&entry.execution_id));
        persist(&self.path, &state)?;
        info!(pruned = drop_ids.len(), "receipt retention applied");
        Ok(drop_ids.len())
    }
}

fn persist(path: &Path, state: &IndexFile) -> anyhow::Result<()> {
    atomic_write_json(path, state)
}

/// Canonical fingerprint of a request body for idempotency comparison.
#[must_use]
pub fn body_fingerprint(body: &Value) -> String {
    use sha2::{Digest, Sha256};
    let canonical = serde_json::to_vec(body).unwrap_or_default();
    hex::encode(Sha256::digest(&canonical))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str, tenant: &str, status: ExecutionStatus) -> ExecutionRecord {
        ExecutionRecord {
            execution_id: id.to_string(),
            button_id: "btn".to_string(),
            spell_id: "acme/hello".to_string(),
            spell_version: None,
            tenant_id: tenant.to_string(),
            actor_role: "operator".to_string(),
            status,
            error_code: None,
            error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            retry_of: None,
            retried_by: None,
            idempotency_key: None,
            dry_run: false,
            input: Map::new(),
            confirmation: Confirmation::default(),
        }
    }

    fn index() -> (tempfile::TempDir, ExecutionIndex) {
        let tmp = tempfile::tempdir().unwrap();
        let index = ExecutionIndex::open(tmp.path().join("logs/index.json")).unwrap();
        (tmp, index)
    }

    #[tokio::test]
    async fn insert_update_get() {
        let (_tmp, index) = index();
        index
            .insert(record("e1", "acme", ExecutionStatus::Queued))
            .await
            .unwrap();
        let updated = index
            .update("e1", |r| r.status = ExecutionStatus::Running)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, ExecutionStatus::Running);
        assert_eq!(
            index.get("e1").await.unwrap().status,
            ExecutionStatus::Running
        );
        assert!(index.update("ghost", |_| {}).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("logs/index.json");

        {
            let index = ExecutionIndex::open(path.clone()).unwrap();
            index
                .insert(record("e1", "acme", ExecutionStatus::Succeeded))
                .await
                .unwrap();
            index
                .idempotency_put(
                    "k1",
                    IdempotencyEntry {
                        execution_id: "e1".into(),
                        body_hash: "abc".into(),
                    },
                )
                .await
                .unwrap();
        }

        let reopened = ExecutionIndex::open(path).unwrap();
        assert_eq!(
            reopened.get("e1").await.unwrap().status,
            ExecutionStatus::Succeeded
        );
        assert_eq!(
            reopened.idempotency_get("k1").await.unwrap().execution_id,
            "e1"
        );
    }

    #[tokio::test]
    async fn list_filters_and_limits() {
        let (_tmp, index) = index();
        index
            .insert(record("e1", "acme", ExecutionStatus::Succeeded))
            .await
            .unwrap();
        index
            .insert(record("e2", "acme", ExecutionStatus::Failed))
            .await
            .unwrap();
        index
            .insert(record("e3", "other", ExecutionStatus::Failed))
            .await
            .unwrap();

        let failed = index
            .list(&ListFilter {
                status: Some(ExecutionStatus::Failed),
                ..ListFilter::default()
            })
            .await;
        assert_eq!(failed.len(), 2);

        let acme_failed = index
            .list(&ListFilter {
                status: Some(ExecutionStatus::Failed),
                tenant_id: Some("acme".into()),
                ..ListFilter::default()
            })
            .await;
        assert_eq!(acme_failed.len(), 1);
        assert_eq!(acme_failed[0].execution_id, "e2");

        let limited = index
            .list(&ListFilter {
                limit: Some(1),
                ..ListFilter::default()
            })
            .await;
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn in_flight_counts_non_terminal() {
        let (_tmp, index) = index();
        index
            .insert(record("e1", "acme", ExecutionStatus::Queued))
            .await
            .unwrap();
        index
            .insert(record("e2", "acme", ExecutionStatus::Running))
            .await
            .unwrap();
        index
            .insert(record("e3", "other", ExecutionStatus::Running))
            .await
            .unwrap();
        index
            .insert(record("e4", "acme", ExecutionStatus::Succeeded))
            .await
            .unwrap();

        assert_eq!(index.in_flight(None).await, 3);
        assert_eq!(index.in_flight(Some("acme")).await, 2);
        assert_eq!(index.in_flight(Some("other")).await, 1);
    }

    #[tokio::test]
    async fn prune_by_count_removes_oldest_and_receipts() {
        let tmp = tempfile::tempdir().unwrap();
        let logs = tmp.path().join("logs");
        std::fs::create_dir_all(&logs).unwrap();
        let index = ExecutionIndex::open(logs.join("index.json")).unwrap();

        for (i, id) in ["e1", "e2", "e3"].iter().enumerate() {
            let mut r = record(id, "acme", ExecutionStatus::Succeeded);
            r.updated_at = Utc::now() - chrono::Duration::minutes(10 - i as i64);
            index.insert(r).await.unwrap();
            std::fs::write(logs.join(format!("{id}.json")), "{}").unwrap();
        }

        let pruned = index.prune(&logs, Some(2), None).await.unwrap();
        assert_eq!(pruned, 1);
        assert!(index.get("e1").await.is_none());
        assert!(!logs.join("e1.json").exists());
        assert!(logs.join("e3.json").exists());
    }

    #[test]
    fn body_fingerprint_is_stable_and_sensitive() {
        let a = body_fingerprint(&json!({"x": 1}));
        let b = body_fingerprint(&json!({"x": 1}));
        let c = body_fingerprint(&json!({"x": 2}));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
