// SPDX-License-Identifier: MIT OR Apache-2.0
//! Audit-trail reconstruction.
//!
//! A read-side query that joins the outbox row, run, artifact, version, and
//! delivery records of a document (or a single version) into one normalized,
//! time-ordered event list. The join follows the structural graph — `run_id`
//! into runs and artifacts, the outbox payload's `run_id`, the version's
//! delivery rows — and sorts by timestamp only for presentation.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use rdp_core::{DocumentVersion, OutboxEntry, Run, RunStatus};
use rdp_store::{DocumentStore, OutboxStore, RunStore, StoreError};
use serde::Serialize;
use std::sync::Arc;

/// Errors from trail reconstruction.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// Store failure.
    #[error("store error")]
    Store(#[from] StoreError),

    /// The requested document does not exist.
    #[error("document {document_id} not found")]
    DocumentNotFound {
        /// Requested document.
        document_id: i64,
    },

    /// The requested version does not exist or belongs to another document.
    #[error("version {version_id} not found for document {document_id}")]
    VersionNotFound {
        /// Requested document.
        document_id: i64,
        /// Requested version.
        version_id: i64,
    },
}

/// One normalized step in a document's processing history.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AuditEvent {
    /// Which record produced the event: `outbox`, `run`, `artifact`,
    /// `document_version`, or `delivery`.
    pub event_type: String,
    /// Id of the producing record.
    pub event_id: i64,
    /// When the step happened (UTC).
    pub timestamp: DateTime<Utc>,
    /// Status of the producing record at read time.
    pub status: String,
    /// Run the step belongs to.
    pub run_id: i64,
    /// Kind of that run.
    pub run_kind: Option<String>,
    /// Artifacts attached to the step.
    pub artifact_ids: Vec<i64>,
    /// Blob pointers of those artifacts.
    pub artifact_uris: Vec<String>,
    /// Version the step concerns, where applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_id: Option<i64>,
    /// Parsed snapshot pointer, where applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parsed_uri: Option<String>,
    /// Diff pointer, where applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff_uri: Option<String>,
    /// Content hash, where applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    /// Failure detail, for failed steps.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Reconstructs audit trails from the stores.
pub struct AuditTrail {
    documents: Arc<dyn DocumentStore>,
    runs: Arc<dyn RunStore>,
    outbox: Arc<dyn OutboxStore>,
}

impl AuditTrail {
    /// Build a reconstructor over the given stores.
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        runs: Arc<dyn RunStore>,
        outbox: Arc<dyn OutboxStore>,
    ) -> Self {
        Self {
            documents,
            runs,
            outbox,
        }
    }

    /// The full trail of a document: every version's steps, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::DocumentNotFound`] for an unknown document, or a
    /// store failure.
    pub async fn document_trail(&self, document_id: i64) -> Result<Vec<AuditEvent>, AuditError> {
        if self.documents.document(document_id).await?.is_none() {
            return Err(AuditError::DocumentNotFound { document_id });
        }
        let versions = self.documents.versions_of(document_id).await?;
        let mut events = Vec::new();
        for version in versions {
            events.extend(self.version_events(&version).await?);
        }
        events.sort_by_key(|e| (e.timestamp, e.event_id));
        Ok(events)
    }

    /// The trail of a single version.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::VersionNotFound`] when the version does not
    /// exist under the document, or a store failure.
    pub async fn version_trail(
        &self,
        document_id: i64,
        version_id: i64,
    ) -> Result<Vec<AuditEvent>, AuditError> {
        let version = self
            .documents
            .version(version_id)
            .await?
            .filter(|v| v.document_id == document_id)
            .ok_or(AuditError::VersionNotFound {
                document_id,
                version_id,
            })?;
        let mut events = self.version_events(&version).await?;
        events.sort_by_key(|e| (e.timestamp, e.event_id));
        Ok(events)
    }

    async fn version_events(
        &self,
        version: &DocumentVersion,
    ) -> Result<Vec<AuditEvent>, AuditError> {
        let run_id = version.run_id;
        let mut events = Vec::new();

        let run = self.runs.run(run_id).await?;
        let run_kind = run.as_ref().map(|r| r.run_kind.as_str().to_string());
        let artifact = self.documents.artifact_by_run(run_id).await?;
        let artifact_ids: Vec<i64> = artifact.iter().map(|a| a.id).collect();
        let artifact_uris: Vec<String> = artifact.iter().map(|a| a.blob_uri.clone()).collect();

        // Step 1: the outbox row that scheduled the run.
        if let Some(outbox) = self.outbox.outbox_for_run(run_id).await? {
            events.push(outbox_event(&outbox, run_id, run_kind.clone()));
        }

        // Step 2: the run itself.
        if let Some(run) = &run {
            events.push(run_event(run));
        }

        // Step 3: the raw fetch.
        if let Some(artifact) = &artifact {
            events.push(AuditEvent {
                event_type: "artifact".to_string(),
                event_id: artifact.id,
                timestamp: artifact.fetched_at,
                status: "COMPLETED".to_string(),
                run_id,
                run_kind: run_kind.clone(),
                artifact_ids: artifact_ids.clone(),
                artifact_uris: artifact_uris.clone(),
                version_id: None,
                parsed_uri: None,
                diff_uri: None,
                content_hash: Some(artifact.fetch_hash.clone()),
                error: None,
            });
        }

        // Step 4: the parsed snapshot.
        events.push(AuditEvent {
            event_type: "document_version".to_string(),
            event_id: version.id,
            timestamp: version.created_at,
            status: "COMPLETED".to_string(),
            run_id,
            run_kind: run_kind.clone(),
            artifact_ids: artifact_ids.clone(),
            artifact_uris: artifact_uris.clone(),
            version_id: Some(version.id),
            parsed_uri: Some(version.parsed_uri.clone()),
            diff_uri: version.diff_uri.clone(),
            content_hash: Some(version.content_hash.clone()),
            error: None,
        });

        // Step 5: downstream hand-offs.
        for delivery in self.documents.deliveries_for_version(version.id).await? {
            let failed = delivery.status == rdp_core::DeliveryStatus::Failed;
            events.push(AuditEvent {
                event_type: "delivery".to_string(),
                event_id: delivery.id,
                timestamp: delivery.created_at,
                status: delivery.status.as_str().to_string(),
                run_id,
                run_kind: run_kind.clone(),
                artifact_ids: artifact_ids.clone(),
                artifact_uris: artifact_uris.clone(),
                version_id: Some(version.id),
                parsed_uri: Some(version.parsed_uri.clone()),
                diff_uri: version.diff_uri.clone(),
                content_hash: Some(version.content_hash.clone()),
                error: failed.then(|| delivery.error_message.unwrap_or_default()),
            });
        }

        Ok(events)
    }
}

fn outbox_event(outbox: &OutboxEntry, run_id: i64, run_kind: Option<String>) -> AuditEvent {
    AuditEvent {
        event_type: "outbox".to_string(),
        event_id: outbox.id,
        timestamp: outbox.created_at,
        status: outbox.status.as_str().to_string(),
        run_id,
        run_kind,
        artifact_ids: Vec::new(),
        artifact_uris: Vec::new(),
        version_id: None,
        parsed_uri: None,
        diff_uri: None,
        content_hash: None,
        error: None,
    }
}

fn run_event(run: &Run) -> AuditEvent {
    AuditEvent {
        event_type: "run".to_string(),
        event_id: run.id,
        timestamp: run.started_at,
        status: run.status.as_str().to_string(),
        run_id: run.id,
        run_kind: Some(run.run_kind.as_str().to_string()),
        artifact_ids: Vec::new(),
        artifact_uris: Vec::new(),
        version_id: None,
        parsed_uri: None,
        diff_uri: None,
        content_hash: None,
        error: (run.status == RunStatus::Failed)
            .then(|| run.error.clone().unwrap_or_default()),
    }
}
