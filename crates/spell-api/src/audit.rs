// SPDX-License-Identifier: MIT OR Apache-2.0
//! Tenant audit log.
//!
//! Every execution state transition appends one JSON line to
//! `logs/tenant-audit.jsonl`. The log is append-only; tenants only ever
//! see lines from their own executions.

use crate::index::{ExecutionRecord, ExecutionStatus};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;

/// One audit line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// When the transition happened.
    pub timestamp: DateTime<Utc>,
    /// Owning tenant.
    pub tenant_id: String,
    /// Execution that transitioned.
    pub execution_id: String,
    /// New status.
    pub status: ExecutionStatus,
    /// Button involved.
    pub button_id: String,
    /// Acting role.
    pub actor_role: String,
}

impl AuditEntry {
    /// Build an entry from a record's current state.
    #[must_use]
    pub fn from_record(record: &ExecutionRecord) -> Self {
        Self {
            timestamp: Utc::now(),
            tenant_id: record.tenant_id.clone(),
            execution_id: record.execution_id.clone(),
            status: record.status,
            button_id: record.button_id.clone(),
            actor_role: record.actor_role.clone(),
        }
    }
}

/// Append one entry to the audit log.
pub fn append(path: &Path, entry: &AuditEntry) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create {}", parent.display()))?;
    }
    let mut line = serde_json::to_vec(entry).context("serialize audit entry")?;
    line.push(b'\n');
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    file.write_all(&line)
        .with_context(|| format!("append {}", path.display()))
}

/// Read the audit log, optionally restricted to one tenant. Unparseable
/// lines are skipped rather than failing the whole read.
pub fn read(path: &Path, tenant_id: Option<&str>) -> Result<Vec<AuditEntry>> {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
    };
    Ok(text
        .lines()
        .filter_map(|line| serde_json::from_str::<AuditEntry>(line).ok())
        .filter(|entry| tenant_id.is_none_or(|t| entry.tenant_id == t))
        .collect())
}
