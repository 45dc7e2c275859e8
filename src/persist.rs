//! Engagement aggregate persistence.
//!
//! The coordinator periodically upserts per-student aggregates keyed by
//! `(session_id, student_id)`; repeated flushes overwrite rather than
//! duplicate a student's row.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::PersistConfig;
use crate::error::{MeshError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngagementRow {
    pub session_id: String,
    pub student_id: String,
    pub questions_answered: u64,
    pub correct_answers: u64,
    #[serde(rename = "avg_response_time")]
    pub avg_response_time_ms: u64,
    pub buddy_interactions: u64,
}

#[async_trait]
pub trait EngagementSink: Send + Sync {
    async fn upsert(&self, rows: &[EngagementRow]) -> Result<()>;
}

/// REST client for the hosted engagement table.
pub struct EngagementStore {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl EngagementStore {
    pub fn new(config: &PersistConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| MeshError::internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            client,
        })
    }
}

#[async_trait]
impl EngagementSink for EngagementStore {
    async fn upsert(&self, rows: &[EngagementRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let url = format!("{}/session_engagement", self.base_url);
        let mut request = self
            .client
            .post(&url)
            .query(&[("on_conflict", "session_id,student_id")])
            .header("Prefer", "resolution=merge-duplicates")
            .json(rows);
        if let Some(key) = &self.api_key {
            request = request.header("apikey", key).bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MeshError::PersistFailed(format!(
                "upsert returned {status}: {body}"
            )));
        }

        tracing::debug!(rows = rows.len(), "Flushed engagement aggregates");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_serializes_to_table_columns() {
        let row = EngagementRow {
            session_id: "sess-1".to_string(),
            student_id: "stud-1".to_string(),
            questions_answered: 4,
            correct_answers: 3,
            avg_response_time_ms: 4200,
            buddy_interactions: 4,
        };

        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["session_id"], "sess-1");
        assert_eq!(json["avg_response_time"], 4200);
        assert_eq!(json["buddy_interactions"], 4);
    }
}
