use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::domain::request::RequestId;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Submitted,
    AutoApproved,
    StepSkipped,
    StepAdvanced,
    StepUnresolvable,
    DecisionRecorded,
    Approved,
    Rejected,
    Returned,
    Cancelled,
    Resubmitted,
    Escalated,
    Expired,
    ReminderSent,
}

impl AuditAction {
    pub fn as_key(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::AutoApproved => "auto_approved",
            Self::StepSkipped => "step_skipped",
            Self::StepAdvanced => "step_advanced",
            Self::StepUnresolvable => "step_unresolvable",
            Self::DecisionRecorded => "decision_recorded",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Returned => "returned",
            Self::Cancelled => "cancelled",
            Self::Resubmitted => "resubmitted",
            Self::Escalated => "escalated",
            Self::Expired => "expired",
            Self::ReminderSent => "reminder_sent",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditActorType {
    User,
    System,
}

/// One immutable log line. Entries chain per request: `prev_hash` links to
/// the previous entry, `entry_hash` covers the entry material and the
/// signature is an HMAC over `entry_hash`, so tampering anywhere in the
/// chain is detectable.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub entry_id: String,
    pub request_id: RequestId,
    pub sequence: u32,
    pub action: AuditAction,
    pub actor_id: String,
    pub actor_type: AuditActorType,
    pub details: BTreeMap<String, String>,
    pub prev_hash: Option<String>,
    pub entry_hash: String,
    pub signature: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainVerification {
    pub request_id: RequestId,
    pub valid: bool,
    pub verified_entries: usize,
    pub failure_reason: Option<String>,
}

/// Append-only audit log, sequenced per request. There is no update or
/// delete; the request projection can be rebuilt by replaying a chain.
pub struct AuditRecorder {
    signing_key: Vec<u8>,
    entries_by_request: Mutex<HashMap<String, Vec<AuditEntry>>>,
}

impl AuditRecorder {
    pub fn new(signing_key: impl AsRef<[u8]>) -> Self {
        Self {
            signing_key: signing_key.as_ref().to_vec(),
            entries_by_request: Mutex::new(HashMap::new()),
        }
    }

    pub fn append(
        &self,
        request_id: &RequestId,
        action: AuditAction,
        actor_id: impl Into<String>,
        actor_type: AuditActorType,
        details: BTreeMap<String, String>,
        at: DateTime<Utc>,
    ) -> AuditEntry {
        let actor_id = actor_id.into();
        let mut entries = self.lock_entries();
        let chain = entries.entry(request_id.0.clone()).or_default();
        let sequence = u32::try_from(chain.len()).unwrap_or(u32::MAX).saturating_add(1);
        let prev_hash = chain.last().map(|entry| entry.entry_hash.clone());
        let entry_hash = hash_entry_material(
            request_id,
            sequence,
            action,
            &actor_id,
            &details,
            prev_hash.as_deref(),
            at,
        );
        let signature = hmac_hex(&self.signing_key, entry_hash.as_bytes());

        let entry = AuditEntry {
            entry_id: Uuid::new_v4().to_string(),
            request_id: request_id.clone(),
            sequence,
            action,
            actor_id,
            actor_type,
            details,
            prev_hash,
            entry_hash,
            signature,
            created_at: at,
        };
        chain.push(entry.clone());
        entry
    }

    pub fn entries_for_request(&self, request_id: &RequestId) -> Vec<AuditEntry> {
        self.lock_entries().get(&request_id.0).cloned().unwrap_or_default()
    }

    /// Every entry across requests, ordered by timestamp with the per-request
    /// sequence as tiebreak.
    pub fn all_entries(&self) -> Vec<AuditEntry> {
        let mut entries: Vec<AuditEntry> =
            self.lock_entries().values().flatten().cloned().collect();
        entries.sort_by(|left, right| {
            left.created_at
                .cmp(&right.created_at)
                .then_with(|| left.request_id.0.cmp(&right.request_id.0))
                .then_with(|| left.sequence.cmp(&right.sequence))
        });
        entries
    }

    pub fn verify_chain(&self, request_id: &RequestId) -> ChainVerification {
        let entries = self.entries_for_request(request_id);
        if entries.is_empty() {
            return ChainVerification {
                request_id: request_id.clone(),
                valid: false,
                verified_entries: 0,
                failure_reason: Some("no audit entries found for request".to_string()),
            };
        }

        let mut previous_hash: Option<String> = None;
        for (index, entry) in entries.iter().enumerate() {
            let expected_sequence = u32::try_from(index).unwrap_or(u32::MAX).saturating_add(1);
            if entry.sequence != expected_sequence {
                return self.failure(
                    request_id,
                    index,
                    format!(
                        "sequence mismatch at entry {}: expected {}, found {}",
                        entry.entry_id, expected_sequence, entry.sequence
                    ),
                );
            }
            if entry.prev_hash != previous_hash {
                return self.failure(
                    request_id,
                    index,
                    format!("previous hash mismatch at entry {}", entry.entry_id),
                );
            }

            let computed = hash_entry_material(
                &entry.request_id,
                entry.sequence,
                entry.action,
                &entry.actor_id,
                &entry.details,
                entry.prev_hash.as_deref(),
                entry.created_at,
            );
            if computed != entry.entry_hash {
                return self.failure(
                    request_id,
                    index,
                    format!("entry hash mismatch at entry {}", entry.entry_id),
                );
            }
            if hmac_hex(&self.signing_key, entry.entry_hash.as_bytes()) != entry.signature {
                return self.failure(
                    request_id,
                    index,
                    format!("signature mismatch at entry {}", entry.entry_id),
                );
            }

            previous_hash = Some(entry.entry_hash.clone());
        }

        ChainVerification {
            request_id: request_id.clone(),
            valid: true,
            verified_entries: entries.len(),
            failure_reason: None,
        }
    }

    fn failure(
        &self,
        request_id: &RequestId,
        verified_entries: usize,
        reason: String,
    ) -> ChainVerification {
        ChainVerification {
            request_id: request_id.clone(),
            valid: false,
            verified_entries,
            failure_reason: Some(reason),
        }
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<AuditEntry>>> {
        match self.entries_by_request.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    #[cfg(test)]
    fn tamper_with(&self, request_id: &RequestId, index: usize, signature: &str) {
        let mut entries = self.lock_entries();
        if let Some(chain) = entries.get_mut(&request_id.0) {
            chain[index].signature = signature.to_string();
        }
    }
}

fn hash_entry_material(
    request_id: &RequestId,
    sequence: u32,
    action: AuditAction,
    actor_id: &str,
    details: &BTreeMap<String, String>,
    prev_hash: Option<&str>,
    at: DateTime<Utc>,
) -> String {
    let details_canonical = serde_json::to_string(details).unwrap_or_default();
    let material = format!(
        "{}|{}|{}|{}|{}|{}|{}",
        request_id.0,
        sequence,
        action.as_key(),
        actor_id,
        details_canonical,
        prev_hash.unwrap_or(""),
        at.to_rfc3339(),
    );
    sha256_hex(material.as_bytes())
}

fn hmac_hex(secret: &[u8], payload: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return sha256_hex(payload),
    };
    mac.update(payload);
    encode_hex(mac.finalize().into_bytes().as_slice())
}

fn sha256_hex(payload: &[u8]) -> String {
    let digest = Sha256::digest(payload);
    encode_hex(digest.as_slice())
}

fn encode_hex(bytes: &[u8]) -> String {
    let mut output = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}
