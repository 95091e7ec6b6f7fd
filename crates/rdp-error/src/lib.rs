// SPDX-License-Identifier: MIT OR Apache-2.0
//! Unified error taxonomy for the regulatory-document pipeline.
//!
//! Every pipeline error carries an [`ErrorClass`] that decides how the
//! surrounding worker reacts: transient errors are retried in place, source
//! and data errors terminate the run, contract errors cause the offending
//! message to be logged and skipped, and internal errors propagate so that
//! supervision restarts the worker.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Broad failure family that drives the recovery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Transient I/O: database timeout, bus publish failure, object-store or
    /// upstream 5xx. Recover in place by retrying with backoff.
    Transient,
    /// The crawled source misbehaved: HTTP 4xx, empty extraction, decode
    /// failure. The run fails; no next-stage event is emitted.
    Source,
    /// Referential breakage: a subscription, source, or version vanished
    /// mid-run. The run fails; operators investigate.
    Data,
    /// Malformed event payload or unknown event type. The message is logged
    /// and skipped without failing the subscription.
    Contract,
    /// Unexpected internal state. Propagates; supervision restarts the worker.
    Internal,
}

impl ErrorClass {
    /// Whether a failure of this class should be retried where it occurred.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient)
    }

    /// Whether a failure of this class terminates the run with `run.failed`.
    #[must_use]
    pub fn fails_run(self) -> bool {
        matches!(self, Self::Source | Self::Data)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Transient => "transient",
            Self::Source => "source",
            Self::Data => "data",
            Self::Contract => "contract",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// A classified pipeline error with message and arbitrary key-value context.
#[derive(Debug, thiserror::Error)]
#[error("{class} error: {message}")]
pub struct PipelineError {
    /// Failure family.
    pub class: ErrorClass,
    /// Human-readable description.
    pub message: String,
    /// Underlying cause, when one exists.
    #[source]
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Arbitrary structured context (ids, urls, topics).
    pub context: BTreeMap<String, serde_json::Value>,
}

impl PipelineError {
    /// Create an error of the given class.
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            cause: None,
            context: BTreeMap::new(),
        }
    }

    /// Shorthand for a [`ErrorClass::Transient`] error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Transient, message)
    }

    /// Shorthand for a [`ErrorClass::Source`] error.
    pub fn source_failure(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Source, message)
    }

    /// Shorthand for a [`ErrorClass::Data`] error.
    pub fn data(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Data, message)
    }

    /// Shorthand for a [`ErrorClass::Contract`] error.
    pub fn contract(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Contract, message)
    }

    /// Shorthand for a [`ErrorClass::Internal`] error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Internal, message)
    }

    /// Attach the underlying cause.
    #[must_use]
    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Attach a structured context entry.
    #[must_use]
    pub fn with_context(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }

    /// Whether the error should be retried where it occurred.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.class.is_retryable()
    }

    /// Render the full cause chain, outermost first, for `error_message`
    /// fields on `run.failed` events.
    #[must_use]
    pub fn chain_message(&self) -> String {
        let mut out = self.message.clone();
        let mut current: Option<&(dyn std::error::Error + 'static)> =
            self.cause.as_deref().map(|e| e as _);
        while let Some(err) = current {
            out.push_str(": ");
            out.push_str(&err.to_string());
            current = err.source();
        }
        out
    }
}
