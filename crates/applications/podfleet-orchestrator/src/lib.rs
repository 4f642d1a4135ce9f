//! # PodFleet Orchestrator
//!
//! Lifecycle orchestration for rented GPU pods.
//!
//! ## Architecture
//!
//! ```text
//!              ┌──────────── Engine ────────────┐
//!  caller ───▶ │ deploy / rolling / bulk        │
//!              │        │                       │
//!              │        ▼                       │
//!              │ ActionCoordinator ──▶ gateway ─┼──▶ RunPod
//!              │        │                 ▲     │
//!              │        ▼                 │     │
//!              │   StateStore ◀──── Reconciler  │
//!              └────────────────────────────────┘
//! ```
//!
//! - The [`store`] holds the latest known pods and GPU availability. Merges
//!   are sequence-numbered so an older fetch never overwrites newer data.
//! - The [`reconciler`] polls the provider on an interval and on demand.
//! - The [`coordinator`] turns every lifecycle operation into a ticket, allows
//!   one in-flight action per pod, and retries transient failures.
//! - Workflows ([`deploy`], [`rolling`], [`bulk`]) run as tasks, report
//!   per-item outcomes, and land in the [`history`] log when finished.
//!
//! ## Failure handling
//!
//! Partial failures are reported, never rolled back. Requests that cannot
//! succeed are rejected before any provider call.

#![warn(clippy::all)]

pub mod bulk;
pub mod config;
pub mod coordinator;
pub mod deploy;
pub mod engine;
pub mod error;
pub mod history;
pub mod reconciler;
pub mod rolling;
pub mod runpod;
pub mod store;
pub mod workflow;

// Scripted in-memory provider
#[cfg(any(test, feature = "mock"))]
pub mod mock;

// ============================================================================
// Public exports
// ============================================================================

// Engine façade
pub use engine::{Engine, WorkflowRequest};

// Configuration
pub use config::{EngineConfig, RetireAction, RetryPolicy, RollingConfig};

// Error handling
pub use error::{ActionFailure, FailureKind, OrchestratorError, Result};

// Live state
pub use reconciler::{RefreshTrigger, Reconciler, ReconcilerHandle};
pub use store::{MergeReport, PodEntry, Snapshot, StateStore};

// Per-pod actions
pub use coordinator::{ActionCoordinator, ActionEvent, ActionTicket, PodAction, TicketState};

// Workflows
pub use bulk::{BulkAction, BulkRequest, BulkSummary};
pub use deploy::{CostEstimate, DeployRequest, estimate_cost};
pub use rolling::{RollingPhase, RollingRequest};
pub use workflow::{
    CancelToken, ItemOutcome, ItemResult, WorkflowHandle, WorkflowKind, WorkflowProgress,
    WorkflowRun, WorkflowStatus,
};

// History
pub use history::{HistoryFilter, HistoryLog};

// Providers
pub use runpod::RunPodGateway;
