//! Groundlink - headless update and configuration agent
//!
//! This library embeds a background reconciliation agent into a deployed
//! binary. Two polling services share one architecture: manifest-driven
//! pipelines with content-addressed verification, persistent state, and a
//! pluggable event bus.
//!
//! # High-Level API
//!
//! For most use cases, the [`agent`] module provides a simplified facade:
//!
//! ```ignore
//! use groundlink::agent::{Agent, AgentConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! let mut config = AgentConfig::new("1.4.0");
//! config.update_manifest_url = Some("https://cp.example.com/update/manifest".to_string());
//! config.config_manifest_url = Some("https://cp.example.com/config/manifest".to_string());
//! let agent = Agent::start(config).await?;
//!
//! // ... run the host application ...
//!
//! agent.shutdown(&CancellationToken::new()).await?;
//! ```
//!
//! Individual services ([`update::UpdateService`], [`config::ConfigService`],
//! [`event::EventDrainService`]) can also be wired by hand and registered
//! with a [`lifecycle::LifecycleManager`].

pub mod agent;
pub mod config;
pub mod context;
pub mod event;
pub mod hash;
pub mod http;
pub mod lifecycle;
pub mod logging;
pub mod manifest;
pub mod update;

/// Version of the groundlink library.
///
/// Embedders typically pass their own binary version to the update service;
/// this constant identifies the agent itself.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
