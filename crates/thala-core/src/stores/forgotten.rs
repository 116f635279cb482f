//! Forgotten store - append-only archive of deleted content

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::records::{ForgottenRecord, StoreRecord, utc_now};

use super::Result;
use super::elastic::ElasticClient;

const INDEX: &str = "forgotten";

/// Append-only archive written ahead of every main-store deletion.
pub struct ForgottenStore {
    client: Arc<ElasticClient>,
}

impl ForgottenStore {
    pub fn new(client: Arc<ElasticClient>) -> Self {
        Self { client }
    }

    /// Append a pre-built archive record.
    pub async fn add(&self, record: &ForgottenRecord) -> Result<Uuid> {
        let document = serde_json::to_value(record)?;
        self.client
            .index_doc(INDEX, &record.id.to_string(), &document)
            .await?;
        Ok(record.id)
    }

    /// Archive a store record that is about to be forgotten.
    pub async fn forget_record(
        &self,
        record: &StoreRecord,
        reason: &str,
        original_store: &str,
    ) -> Result<Uuid> {
        let forgotten = ForgottenRecord {
            id: Uuid::new_v4(),
            source_type: record.source_type,
            bib_key: record.bib_key.clone(),
            forgotten_reason: reason.to_string(),
            original_store: original_store.to_string(),
            previous_data: serde_json::to_value(record)?,
            created_at: utc_now(),
        };
        self.add(&forgotten).await?;
        debug!(id = %forgotten.id, reason, "archived record to forgotten");
        Ok(forgotten.id)
    }

    /// Search the archive with the vendor query DSL.
    pub async fn search(&self, query: &Value, size: usize) -> Result<Vec<ForgottenRecord>> {
        let hits = self.client.search(INDEX, query, size).await?;
        Ok(hits
            .into_iter()
            .filter_map(|hit| serde_json::from_value(hit.source).ok())
            .collect())
    }
}
