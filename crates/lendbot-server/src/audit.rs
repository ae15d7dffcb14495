//! Append-only, hash-chained JSONL trail of processed webhooks.

use lendbot_kernel::sha256_hex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    pub audit_id: String,
    pub event_id: String,
    pub stage: String,
    pub result: String,
    pub reason_code: String,
    pub ts: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_hash: Option<String>,
    pub record_hash: String,
}

impl AuditRecord {
    pub fn new(event_id: &str, stage: &str, result: &str, reason_code: &str, ts: String) -> Self {
        Self {
            audit_id: format!("audit_{}", uuid::Uuid::new_v4().as_simple()),
            event_id: event_id.to_string(),
            stage: stage.to_string(),
            result: result.to_string(),
            reason_code: reason_code.to_string(),
            ts,
            prev_hash: None,
            record_hash: String::new(),
        }
    }

    /// Hash over the record serialized with an empty `record_hash`.
    fn seal(&self) -> Result<String, serde_json::Error> {
        let mut seeded = self.clone();
        seeded.record_hash.clear();
        let seed = serde_json::to_string(&seeded)?;
        Ok(sha256_hex(seed.as_bytes()))
    }
}

struct Tail {
    file: tokio::fs::File,
    last_hash: Option<String>,
}

pub struct AuditJsonl {
    tail: Mutex<Tail>,
}

impl AuditJsonl {
    pub async fn open(path: &str) -> Result<Self, String> {
        let last_hash = std::fs::read_to_string(path).ok().and_then(|text| {
            text.lines().rev().find_map(|line| {
                serde_json::from_str::<AuditRecord>(line)
                    .ok()
                    .map(|rec| rec.record_hash)
            })
        });
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| format!("open audit log {path}: {e}"))?;
        Ok(Self {
            tail: Mutex::new(Tail { file, last_hash }),
        })
    }

    /// Chains and writes one record. Write failures are logged; the trail
    /// never fails a request.
    pub async fn append(&self, mut rec: AuditRecord) {
        let mut tail = self.tail.lock().await;
        rec.prev_hash = tail.last_hash.clone();
        rec.record_hash = match rec.seal() {
            Ok(hash) => hash,
            Err(e) => {
                warn!(error = %e, "audit record serialize failed");
                return;
            }
        };
        let line = match serde_json::to_string(&rec) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "audit record serialize failed");
                return;
            }
        };
        let written = async {
            tail.file.write_all(line.as_bytes()).await?;
            tail.file.write_all(b"\n").await?;
            tail.file.flush().await
        }
        .await;
        match written {
            Ok(()) => tail.last_hash = Some(rec.record_hash),
            Err(e) => warn!(error = %e, event_id = %rec.event_id, "audit write failed"),
        }
    }
}

pub fn verify_audit_chain(path: &str) -> Result<String, String> {
    let text = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let mut prev: Option<String> = None;
    let mut count = 0usize;

    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let rec: AuditRecord = serde_json::from_str(line)
            .map_err(|e| format!("line {} parse failed: {e}", idx + 1))?;
        if count > 0 && rec.prev_hash != prev {
            return Err(format!(
                "line {} prev_hash mismatch: expected {:?}, got {:?}",
                idx + 1,
                prev,
                rec.prev_hash
            ));
        }
        let expected = rec
            .seal()
            .map_err(|e| format!("line {} hash seed serialize failed: {e}", idx + 1))?;
        if rec.record_hash != expected {
            return Err(format!(
                "line {} record_hash mismatch: expected {}, got {}",
                idx + 1,
                expected,
                rec.record_hash
            ));
        }
        prev = Some(rec.record_hash);
        count += 1;
    }

    Ok(format!("audit chain verified: {count} records"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(tag: &str) -> String {
        std::env::temp_dir()
            .join(format!("lendbot-audit-{tag}-{}.jsonl", uuid::Uuid::new_v4().as_simple()))
            .to_string_lossy()
            .to_string()
    }

    fn rec(event_id: &str) -> AuditRecord {
        AuditRecord::new(event_id, "card_action", "ok", "ok", "2026-01-01T00:00:00Z".into())
    }

    #[tokio::test]
    async fn chain_survives_reopen() {
        let path = temp_path("reopen");
        {
            let audit = AuditJsonl::open(&path).await.unwrap();
            audit.append(rec("ev1")).await;
            audit.append(rec("ev2")).await;
        }
        let audit = AuditJsonl::open(&path).await.unwrap();
        audit.append(rec("ev3")).await;
        assert_eq!(verify_audit_chain(&path).unwrap(), "audit chain verified: 3 records");
    }

    #[tokio::test]
    async fn tampered_record_is_detected() {
        let path = temp_path("tamper");
        let audit = AuditJsonl::open(&path).await.unwrap();
        audit.append(rec("ev1")).await;
        audit.append(rec("ev2")).await;
        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, text.replacen("\"ev1\"", "\"evX\"", 1)).unwrap();
        let err = verify_audit_chain(&path).unwrap_err();
        assert!(err.contains("line 1 record_hash mismatch"), "{err}");
    }
}
