// SPDX-License-Identifier: MIT OR Apache-2.0
//! Pipeline daemon: wires stores, bus, and blob store into the scheduling
//! loops, the stage consumers, and the HTTP control surface.
//!
//! The same [`PipelineRuntime`] drives production (Postgres + NATS + S3) and
//! the hermetic end-to-end tests (in-memory adapters); only the component
//! construction differs.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// HTTP control surface.
pub mod app;
/// Worker-loop supervision.
pub mod runtime;

pub use app::{AppState, build_app};
pub use runtime::{PipelineComponents, PipelineRuntime};
