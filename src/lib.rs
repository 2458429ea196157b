//! gampflow - Event-driven GAMP categorization workflow engine
//!
//! Categorizes a regulated-software document into a GAMP software category,
//! routes uncertain or high-risk results to a human, fans the validation
//! plan out to specialist agents, and generates the validation artifact.
//!
//! # Architecture
//!
//! The system is built around typed events and an audited context store:
//! - Steps declare what they consume, produce, and write; the graph is
//!   validated before a run starts
//! - Every context write, consultation transition, and failure is recorded
//!   in an append-only audit log
//! - A checkpoint after every step lets failed runs resume where they stopped
//!
//! # Modules
//!
//! - `adapters`: Oracle, agent, and human-decision interfaces
//! - `core`: Scheduler, context store, categorization, consultation gate,
//!   agent coordination, and the workflow itself
//! - `domain`: Data structures (Event, WorkflowRun, CategorizationResult)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Categorize a document
//! gampflow run --input urs.md
//!
//! # Answer a pending consultation
//! gampflow pending <run-id>
//! gampflow decide <run-id> <consultation-id> approve --actor qa-lead
//!
//! # Resume a failed run
//! gampflow resume <run-id>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod error;

// Re-export main types at crate root for convenience
pub use core::{RunHistory, WorkflowOrchestrator};
pub use domain::{Document, Event, EventKind, EventPayload, GampCategory, RunStatus, WorkflowRun};
pub use error::{WorkflowError, WorkflowResult};
