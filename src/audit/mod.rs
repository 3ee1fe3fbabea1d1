//! Audit trail for pipeline actions
//!
//! Recording is fire-and-forget: a sink never fails or stalls the caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

/// Receiver of audit events (action, detail, result)
pub trait AuditSink: Send + Sync {
    fn record(&self, action: &str, detail: &str, result: &str);
}

/// Sink that drops everything
pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn record(&self, _action: &str, _detail: &str, _result: &str) {}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub audit_id: Uuid,
    pub action: String,
    pub detail: String,
    pub result: String,
    pub created_at: DateTime<Utc>,
    pub digest: String,
}

#[derive(Serialize)]
struct DigestView<'a> {
    action: &'a str,
    detail: &'a str,
    result: &'a str,
    created_at: &'a DateTime<Utc>,
}

impl AuditEntry {
    fn new(action: &str, detail: &str, result: &str) -> Self {
        let created_at = Utc::now();
        let digest = compute_digest(action, detail, result, &created_at);
        Self {
            audit_id: Uuid::new_v4(),
            action: action.to_string(),
            detail: detail.to_string(),
            result: result.to_string(),
            created_at,
            digest,
        }
    }
}

/// In-memory audit trail, bounded to the most recent `capacity` entries
pub struct AuditLog {
    entries: Mutex<Vec<AuditEntry>>,
    capacity: usize,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::with_capacity(1000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<AuditEntry>> {
        // A poisoned log is still a usable log.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.lock().clone()
    }

    /// Entries for one action name, oldest first
    pub fn entries_for(&self, action: &str) -> Vec<AuditEntry> {
        self.lock()
            .iter()
            .filter(|e| e.action == action)
            .cloned()
            .collect()
    }

    pub fn get(&self, audit_id: Uuid) -> Option<AuditEntry> {
        self.lock().iter().find(|e| e.audit_id == audit_id).cloned()
    }

    /// Verify a record's integrity via its digest
    pub fn verify_integrity(&self, audit_id: Uuid) -> bool {
        match self.get(audit_id) {
            Some(entry) => {
                compute_digest(&entry.action, &entry.detail, &entry.result, &entry.created_at)
                    == entry.digest
            }
            None => false,
        }
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditSink for AuditLog {
    fn record(&self, action: &str, detail: &str, result: &str) {
        let entry = AuditEntry::new(action, detail, result);
        debug!(action, result, audit_id = %entry.audit_id, "Audit entry recorded");

        let mut entries = self.lock();
        if entries.len() >= self.capacity {
            entries.remove(0);
        }
        entries.push(entry);
    }
}

/// SHA256 over the entry's JSON form, streamed straight into the hasher
fn compute_digest(action: &str, detail: &str, result: &str, created_at: &DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    let view = DigestView {
        action,
        detail,
        result,
        created_at,
    };

    if serde_json::to_writer(&mut HashWriter(&mut hasher), &view).is_err() {
        return String::new();
    }

    hex::encode(hasher.finalize())
}

/// Adapter to allow writing into Sha256 via std::io::Write
struct HashWriter<'a, H: Digest>(&'a mut H);

impl<'a, H: Digest> Write for HashWriter<'a, H> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
