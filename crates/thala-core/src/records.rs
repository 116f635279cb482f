//! Record model - the canonical units of the knowledge base
//!
//! Every persisted entity is one of four record shapes:
//! - [`StoreRecord`]: source content at a compression level (L0/L1/L2)
//! - [`CoherenceRecord`]: identity, beliefs, preferences with confidence
//! - [`WhoIWasRecord`]: pre-mutation snapshot (the audit log)
//! - [`ForgottenRecord`]: pre-deletion archive with a required reason

use std::collections::BTreeMap;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Current UTC timestamp. Single definition so record code agrees on "now".
pub fn utc_now() -> DateTime<Utc> {
    Utc::now()
}

// ============================================================================
// SOURCE TYPE
// ============================================================================

/// Where a record came from.
///
/// External records carry a bibliographic key; internal records are
/// system-generated derivatives (summaries, syntheses).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    /// Ingested from an outside source, linked to the bibliographic system
    External,
    /// Produced by the pipeline itself
    #[default]
    Internal,
}

impl SourceType {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::External => "external",
            SourceType::Internal => "internal",
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// BIB KEY VALIDATION
// ============================================================================

static BIB_KEY_RE: OnceLock<Regex> = OnceLock::new();

/// Check that a bibliographic key is 8 alphanumeric characters.
pub fn is_valid_bib_key(key: &str) -> bool {
    let re = BIB_KEY_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9]{8}$").expect("static regex"));
    re.is_match(key)
}

// ============================================================================
// STORE RECORD
// ============================================================================

/// A source document or one of its compressed derivatives.
///
/// `compression_level` partitions the main store: 0 = original text,
/// 1 = ~100-word summary, 2 = ~10:1 compressed summary. Derivatives carry
/// their parent ids in `source_ids`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreRecord {
    /// Unique identifier (UUID v4)
    pub id: Uuid,
    /// External (bibliographic) or internal (derived) origin
    pub source_type: SourceType,
    /// Text payload
    pub content: String,
    /// 0 = original, 1 = short summary, 2 = tenth summary
    pub compression_level: u8,
    /// Parent record ids for derived records (lineage)
    #[serde(default)]
    pub source_ids: Vec<Uuid>,
    /// 8-char key into the bibliographic system
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bib_key: Option<String>,
    /// ISO 639-1 code detected on L0, propagated to derivatives
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language_code: Option<String>,
    /// Embedding vector (always present on L1/L2, absent on L0 by convention)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Model that produced the embedding
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_model: Option<String>,
    /// Free-form indexing helpers (word counts, section tags, derivation origin)
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    /// When the record was created
    pub created_at: DateTime<Utc>,
    /// When the record was last modified
    pub updated_at: DateTime<Utc>,
}

impl Default for StoreRecord {
    fn default() -> Self {
        let now = utc_now();
        Self {
            id: Uuid::new_v4(),
            source_type: SourceType::Internal,
            content: String::new(),
            compression_level: 0,
            source_ids: vec![],
            bib_key: None,
            language_code: None,
            embedding: None,
            embedding_model: None,
            metadata: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

impl StoreRecord {
    /// Create a new L0 record with the given content
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    /// Create a derivative record at `level` whose lineage points at `parent`.
    pub fn derived_from(parent: &StoreRecord, level: u8, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            compression_level: level,
            source_ids: vec![parent.id],
            bib_key: parent.bib_key.clone(),
            language_code: parent.language_code.clone(),
            ..Default::default()
        }
    }

    /// Validate the structural invariants that must hold before persisting.
    ///
    /// External records need a well-formed bib key; derivatives need lineage.
    pub fn validate(&self) -> Result<(), String> {
        if self.compression_level > 2 {
            return Err(format!(
                "compression_level {} out of range (0..=2)",
                self.compression_level
            ));
        }
        if self.source_type == SourceType::External {
            match &self.bib_key {
                Some(key) if is_valid_bib_key(key) => {}
                Some(key) => return Err(format!("malformed bib_key: {key:?}")),
                None => return Err("external record without bib_key".to_string()),
            }
        }
        if self.compression_level > 0 && self.source_ids.is_empty() {
            return Err(format!(
                "L{} record has no source_ids",
                self.compression_level
            ));
        }
        Ok(())
    }

    /// Word count of the content (whitespace split)
    pub fn word_count(&self) -> usize {
        self.content.split_whitespace().count()
    }
}

// ============================================================================
// COHERENCE RECORD
// ============================================================================

/// A long-lived statement about identity, beliefs or preferences.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoherenceRecord {
    /// Unique identifier (UUID v4)
    pub id: Uuid,
    pub source_type: SourceType,
    /// The statement itself
    pub content: String,
    /// Category tag (identity, belief, preference, ...)
    pub category: String,
    /// How strongly this is held (0.0 to 1.0)
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bib_key: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for CoherenceRecord {
    fn default() -> Self {
        let now = utc_now();
        Self {
            id: Uuid::new_v4(),
            source_type: SourceType::Internal,
            content: String::new(),
            category: "belief".to_string(),
            confidence: 0.5,
            bib_key: None,
            metadata: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

// ============================================================================
// HISTORY AND ARCHIVE RECORDS
// ============================================================================

/// Snapshot written before any mutation or deletion of a tracked record.
///
/// `previous_data` carries the full prior serialization, so history can
/// reconstruct exactly what the record looked like before the change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhoIWasRecord {
    pub id: Uuid,
    /// Id of the record being changed
    pub supersedes: Uuid,
    /// Why the change happened (required, never empty)
    pub reason: String,
    /// Full serialization of the record before the change
    pub previous_data: Value,
    /// Which logical store the record lived in ("coherence", "store_l0", ...)
    pub original_store: String,
    pub created_at: DateTime<Utc>,
}

impl WhoIWasRecord {
    /// Snapshot a record ahead of a mutation.
    pub fn snapshot(
        supersedes: Uuid,
        reason: impl Into<String>,
        previous_data: Value,
        original_store: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            supersedes,
            reason: reason.into(),
            previous_data,
            original_store: original_store.into(),
            created_at: utc_now(),
        }
    }
}

/// Archive entry written before any deletion from the main store.
///
/// Same shape as history but partitioned separately: forgetting is a
/// deliberate act with a human-meaningful reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForgottenRecord {
    pub id: Uuid,
    pub source_type: SourceType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bib_key: Option<String>,
    /// Why the record was forgotten (required, never empty)
    pub forgotten_reason: String,
    /// Which logical store it came from
    pub original_store: String,
    /// Full serialization of the record at deletion time
    pub previous_data: Value,
    pub created_at: DateTime<Utc>,
}

/// Reject empty or whitespace-only reasons for history/archive writes.
pub fn require_reason(reason: &str) -> Result<(), String> {
    if reason.trim().is_empty() {
        Err("a non-empty reason is required".to_string())
    } else {
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bib_key_validation() {
        assert!(is_valid_bib_key("ABCD1234"));
        assert!(is_valid_bib_key("abcdefgh"));
        assert!(!is_valid_bib_key("ABC123"));
        assert!(!is_valid_bib_key("ABCD12345"));
        assert!(!is_valid_bib_key("ABCD-234"));
        assert!(!is_valid_bib_key(""));
    }

    #[test]
    fn test_external_requires_bib_key() {
        let mut record = StoreRecord::new("content");
        record.source_type = SourceType::External;
        assert!(record.validate().is_err());

        record.bib_key = Some("ZXCV0987".to_string());
        assert!(record.validate().is_ok());

        record.bib_key = Some("bad key!".to_string());
        assert!(record.validate().is_err());
    }

    #[test]
    fn test_derivative_requires_lineage() {
        let mut record = StoreRecord::new("a summary");
        record.compression_level = 1;
        assert!(record.validate().is_err());

        let parent = StoreRecord::new("the original");
        let derived = StoreRecord::derived_from(&parent, 1, "a summary");
        assert!(derived.validate().is_ok());
        assert_eq!(derived.source_ids, vec![parent.id]);
    }

    #[test]
    fn test_derived_inherits_bib_key_and_language() {
        let mut parent = StoreRecord::new("original");
        parent.source_type = SourceType::External;
        parent.bib_key = Some("AAAA1111".to_string());
        parent.language_code = Some("de".to_string());

        let derived = StoreRecord::derived_from(&parent, 2, "summary");
        assert_eq!(derived.bib_key.as_deref(), Some("AAAA1111"));
        assert_eq!(derived.language_code.as_deref(), Some("de"));
        assert_eq!(derived.compression_level, 2);
    }

    #[test]
    fn test_store_record_round_trip() {
        let mut record = StoreRecord::new("hello world");
        record
            .metadata
            .insert("word_count".to_string(), Value::from(2));
        record.embedding = Some(vec![0.1, 0.2, 0.3]);

        let json = serde_json::to_value(&record).unwrap();
        let back: StoreRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back.id, record.id);
        assert_eq!(back.content, record.content);
        assert_eq!(back.metadata, record.metadata);
        assert_eq!(back.embedding, record.embedding);
    }

    #[test]
    fn test_absent_optionals_not_serialized() {
        let record = StoreRecord::new("x");
        let json = serde_json::to_value(&record).unwrap();
        let obj = json.as_object().unwrap();
        assert!(!obj.contains_key("bib_key"));
        assert!(!obj.contains_key("embedding"));
        assert!(!obj.contains_key("language_code"));
    }

    #[test]
    fn test_who_i_was_snapshot_round_trips() {
        let record = StoreRecord::new("before");
        let snapshot = WhoIWasRecord::snapshot(
            record.id,
            "refined by user",
            serde_json::to_value(&record).unwrap(),
            "store_l0",
        );
        let restored: StoreRecord = serde_json::from_value(snapshot.previous_data).unwrap();
        assert_eq!(restored.id, record.id);
        assert_eq!(restored.content, "before");
        assert_eq!(snapshot.reason, "refined by user");
    }

    #[test]
    fn test_require_reason() {
        assert!(require_reason("cleanup").is_ok());
        assert!(require_reason("").is_err());
        assert!(require_reason("   ").is_err());
    }
}
