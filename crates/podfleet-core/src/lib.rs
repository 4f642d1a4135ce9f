//! PodFleet Core - Shared types and traits
//!
//! This crate defines the core abstractions used across:
//! - podfleet-orchestrator (engine + operator binary)
//! - any provider gateway implementation (RunPod, mocks)
//!
//! Key types:
//! - ProviderGateway trait (interface for the remote compute provider)
//! - Pod / GpuType / Template records and lifecycle enums
//! - GatewayError taxonomy

pub mod types;
pub mod traits;
pub mod error;

pub use types::*;
pub use traits::*;
pub use error::*;
