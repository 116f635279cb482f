//! Citation validation against the corpus and the bibliographic system
//!
//! Two modes: corpus-only (fast, offline) and bibliographic verification.
//! With `verify_all` the bibliographic system is the source of truth - a
//! key is valid if it exists there, regardless of the corpus; without it,
//! only newly introduced keys are verified and the prior corpus is trusted.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use thala_core::stores::ZoteroStore;

use super::{doi_key, extract_citation_keys, is_plausible_citation_key};

/// Concurrent key verifications against the bibliographic system
const KEY_VERIFY_CONCURRENCY: usize = 10;

/// Outcome of validating an edited section's citations.
#[derive(Debug, Clone)]
pub struct CitationValidation {
    pub is_valid: bool,
    /// Keys that failed, with a short reason
    pub invalid: Vec<String>,
    /// Keys confirmed to exist in the bibliographic system
    pub verified: HashSet<String>,
}

/// Expand corpus keys with per-paper bib keys and DOI-derived variants.
pub fn corpus_key_set(
    corpus_keys: &HashSet<String>,
    paper_bib_keys: &HashMap<String, String>,
) -> HashSet<String> {
    let mut all = corpus_keys.clone();
    for (doi, key) in paper_bib_keys {
        all.insert(key.clone());
        all.insert(doi_key(doi));
    }
    all
}

/// Corpus-only validation of an edited section.
pub fn validate_edit_citations(
    edited_section: &str,
    corpus_keys: &HashSet<String>,
) -> CitationValidation {
    let cited = extract_citation_keys(edited_section);

    let invalid: Vec<String> = cited
        .iter()
        .filter(|key| {
            !corpus_keys.contains(*key) && !is_plausible_citation_key(key, corpus_keys)
        })
        .map(|key| format!("{key} (not in corpus)"))
        .collect();

    CitationValidation {
        is_valid: invalid.is_empty(),
        invalid,
        verified: HashSet::new(),
    }
}

/// Verify a set of keys against the bibliographic system, bounded.
pub async fn verify_keys_batch(
    keys: &HashSet<String>,
    zotero: &ZoteroStore,
) -> HashMap<String, bool> {
    if keys.is_empty() {
        return HashMap::new();
    }

    let semaphore = Arc::new(Semaphore::new(KEY_VERIFY_CONCURRENCY));
    let tasks = keys.iter().map(|key| {
        let semaphore = semaphore.clone();
        async move {
            let _permit = semaphore.acquire().await.expect("semaphore never closed");
            let exists = match zotero.exists(key).await {
                Ok(exists) => exists,
                Err(e) => {
                    warn!(key, "bibliographic verification failed: {e}");
                    false
                }
            };
            (key.clone(), exists)
        }
    });

    join_all(tasks).await.into_iter().collect()
}

/// Validate an edited section with bibliographic verification.
///
/// `verify_all=true` checks every cited key against the bibliographic
/// system (keys found there are valid even if unknown to the corpus);
/// `verify_all=false` verifies only keys that are new relative to the
/// original section and corpus.
pub async fn validate_edit_citations_with_bib(
    original_section: &str,
    edited_section: &str,
    corpus_keys: &HashSet<String>,
    zotero: &ZoteroStore,
    verify_all: bool,
) -> CitationValidation {
    let edited_citations = extract_citation_keys(edited_section);
    let original_citations = extract_citation_keys(original_section);

    let mut invalid: Vec<String> = Vec::new();
    let mut verified: HashSet<String> = HashSet::new();

    if verify_all {
        info!(
            count = edited_citations.len(),
            "verifying all citations against the bibliographic system"
        );
        let results = verify_keys_batch(&edited_citations, zotero).await;

        for (key, exists) in results {
            if exists {
                verified.insert(key);
            } else if corpus_keys.contains(&key) {
                // In the corpus but not the bib system: trust the corpus
                debug!(key, "citation in corpus but not in bibliographic system");
                verified.insert(key);
            } else {
                warn!(key, "citation not found in bibliographic system or corpus");
                invalid.push(format!("{key} (not found in bibliographic system)"));
            }
        }
    } else {
        // Citations carried over from the original are trusted
        verified.extend(original_citations.intersection(&edited_citations).cloned());

        let new_citations: HashSet<String> = edited_citations
            .difference(&original_citations)
            .filter(|key| !corpus_keys.contains(*key))
            .cloned()
            .collect();

        let results = verify_keys_batch(&new_citations, zotero).await;
        for (key, exists) in results {
            if exists {
                info!(key, "new citation verified");
                verified.insert(key);
            } else {
                warn!(key, "new citation not found in bibliographic system");
                invalid.push(format!("{key} (not found in bibliographic system)"));
            }
        }

        for key in &edited_citations {
            if !corpus_keys.contains(key)
                && !verified.contains(key)
                && !invalid.iter().any(|entry| entry.starts_with(key.as_str()))
                && !is_plausible_citation_key(key, corpus_keys)
            {
                invalid.push(format!("{key} (not in corpus)"));
            }
        }
    }

    CitationValidation {
        is_valid: invalid.is_empty(),
        invalid,
        verified,
    }
}

/// Partition every citation in a document into valid and invalid keys.
pub async fn validate_citations_against_bib(
    text: &str,
    zotero: &ZoteroStore,
    known_valid: &HashSet<String>,
) -> (HashSet<String>, HashSet<String>) {
    let all_keys = extract_citation_keys(text);
    if all_keys.is_empty() {
        return (HashSet::new(), HashSet::new());
    }

    let to_verify: HashSet<String> = all_keys.difference(known_valid).cloned().collect();
    if to_verify.is_empty() {
        return (all_keys, HashSet::new());
    }

    let results = verify_keys_batch(&to_verify, zotero).await;
    let mut valid = known_valid.intersection(&all_keys).cloned().collect::<HashSet<_>>();
    let mut invalid = HashSet::new();
    for (key, exists) in results {
        if exists {
            valid.insert(key);
        } else {
            invalid.insert(key);
        }
    }
    (valid, invalid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn keys(values: &[&str]) -> HashSet<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_corpus_only_validation() {
        let corpus = keys(&["GOOD1234"]);
        let ok = validate_edit_citations("cites [@GOOD1234] only", &corpus);
        assert!(ok.is_valid);

        let bad = validate_edit_citations("cites [@FAKE9999]", &corpus);
        assert!(!bad.is_valid);
        assert_eq!(bad.invalid.len(), 1);
        assert!(bad.invalid[0].contains("FAKE9999"));
    }

    #[test]
    fn test_corpus_key_set_includes_doi_variants() {
        let mut bib_keys = HashMap::new();
        bib_keys.insert("10.1/x".to_string(), "AAAA1111".to_string());
        let all = corpus_key_set(&keys(&["BBBB2222"]), &bib_keys);
        assert!(all.contains("AAAA1111"));
        assert!(all.contains("BBBB2222"));
        assert!(all.contains(&doi_key("10.1/x")));
    }

    async fn mock_bib(server: &MockServer, existing: &[&str]) {
        for key in existing {
            Mock::given(method("POST"))
                .and(path("/local-crud/item"))
                .and(body_partial_json(json!({"action": "get", "key": key})))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "key": key, "itemType": "journalArticle", "version": 1,
                })))
                .mount(server)
                .await;
        }
        Mock::given(method("POST"))
            .and(path("/local-crud/item"))
            .respond_with(ResponseTemplate::new(404))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_verify_all_makes_bib_system_source_of_truth() {
        let server = MockServer::start().await;
        mock_bib(&server, &["REAL1234"]).await;
        let zotero = ZoteroStore::new(server.uri()).unwrap();

        let validation = validate_edit_citations_with_bib(
            "original text",
            "cites [@REAL1234] and [@ZZZZZZZZ]",
            &HashSet::new(),
            &zotero,
            true,
        )
        .await;

        assert!(!validation.is_valid);
        assert!(validation.verified.contains("REAL1234"));
        assert_eq!(validation.invalid.len(), 1);
        assert!(validation.invalid[0].starts_with("ZZZZZZZZ"));
    }

    #[tokio::test]
    async fn test_incremental_mode_trusts_prior_corpus() {
        let server = MockServer::start().await;
        mock_bib(&server, &[]).await;
        let zotero = ZoteroStore::new(server.uri()).unwrap();

        // CORP0001 is corpus-known; OLD00001 was already cited; NEWBAD99 is new
        let validation = validate_edit_citations_with_bib(
            "text citing [@OLD00001]",
            "text citing [@OLD00001] and [@CORP0001] and [@NEWBAD99]",
            &keys(&["CORP0001"]),
            &zotero,
            false,
        )
        .await;

        assert!(!validation.is_valid);
        assert!(validation.verified.contains("OLD00001"));
        assert_eq!(validation.invalid.len(), 1);
        assert!(validation.invalid[0].starts_with("NEWBAD99"));
    }

    #[tokio::test]
    async fn test_document_partition() {
        let server = MockServer::start().await;
        mock_bib(&server, &["REAL1234"]).await;
        let zotero = ZoteroStore::new(server.uri()).unwrap();

        let (valid, invalid) = validate_citations_against_bib(
            "both [@REAL1234] and [@MISS0000] appear",
            &zotero,
            &HashSet::new(),
        )
        .await;
        assert!(valid.contains("REAL1234"));
        assert!(invalid.contains("MISS0000"));
    }
}
