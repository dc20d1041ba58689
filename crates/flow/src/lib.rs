//! Crate `flow`: self-service flows of an identity server.
//!
//! A `Flow` is a short-lived, persisted state machine driving one login,
//! registration, recovery, verification or settings operation. Pluggable
//! `Strategy` implementations contribute fragments to the flow's
//! `UiContainer` form and handle submissions; the `FlowEngine` owns the
//! lifecycle and merges fragments deterministically.
//!
//! Design summary:
//! - Every mutation goes through `Flow::apply`, which checks expiry, csrf
//!   token and status before changing anything.
//! - Persistence is behind the `Persister` traits; writes of a flow are
//!   guarded by its `version` (`PersistResult::Conflict` on a lost race).
//! - Strategy rejections become a re-render with an error message; only
//!   infrastructure failures are returned as errors.
//!
//! Quick example:
//! ```rust
//! use flow::stubs::{InMemoryPersister, LinkStrategy};
//! use flow::{FlowEngine, FlowEngineConfig, FlowType, StrategyRegistry};
//! use std::sync::Arc;
//! let repo = Arc::new(InMemoryPersister::new());
//! let strategies = StrategyRegistry::new().with(Arc::new(LinkStrategy::new(Arc::clone(&repo)))).unwrap();
//! let engine = FlowEngine::new(repo, strategies, FlowEngineConfig::default());
//! let flow = engine.create_flow(FlowType::Recovery, "https://app.example.org/recover", None).unwrap();
//! assert!(flow.ui.find_input("link", "email").is_some());
//! ```
pub mod config;
pub mod domain;
pub mod engine;
pub mod errors;
pub mod identity;
pub mod method_config;
pub mod repository;
pub mod service;
pub mod strategy;
pub mod stubs;
pub mod ui;

pub use config::*;
pub use domain::*;
pub use engine::*;
pub use errors::*;
pub use identity::*;
pub use method_config::*;
pub use repository::*;
pub use service::*;
pub use strategy::*;
pub use ui::*;
