//! # Trawl
//!
//! The event-driven core of a reconnaissance engine: modules publish facts,
//! the bus fans them out to whoever listens, and the controller runs a scan
//! from seed to terminal state.
//!
//! ## Core Concepts
//!
//! - [`ScanEvent`] = a fact (type tag + data) with a link to the event that
//!   caused it. Following the links upward always ends at ROOT.
//! - [`Module`] = a probe. It declares what it consumes and produces, reacts
//!   to delivered events and publishes new ones.
//! - [`EventBus`] = stores every event and delivers it, depth first, to the
//!   modules that listen for its type.
//! - [`ScanController`] = one scan at a time: config, setup, wiring, seed,
//!   start, stop, terminal status.
//!
//! ## Architecture
//!
//! ```text
//! ScanController.start_scan()
//!     │
//!     ├─► ModuleRegistry ─► instantiate + setup()
//!     │
//!     ▼ spawn
//! scan task
//!     │
//!     ├─► ROOT, seed ──► EventBus.publish()
//!     │                     │
//!     │                     ├─► cycle check ─► ScanStore.store_event()
//!     │                     │
//!     │                     └─► Module A.handle_event() ─► ctx.emit() ─┐
//!     │                         Module B.handle_event()                │
//!     │                            ▲                                   │
//!     │                            └──────── depth first ──────────────┘
//!     │
//!     └─► Module.start() for each module
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Provenance is a tree** - every event but ROOT has exactly one parent
//! 2. **Everything is stored** - including events whose delivery was suppressed
//! 3. **A fact never re-triggers its own ancestry** - same type and data
//!    (ignoring case) already upstream means store-only
//! 4. **Delivery is deterministic** - listeners by name, children before siblings
//! 5. **One scan at a time** - a second `start_scan` is refused, not queued
//! 6. **Stopping is cooperative** - flags, never interruption
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use trawl::{
//!     async_trait, EventType, MemoryStore, Module, ModuleContext, ModuleRegistry,
//!     ScanController, ScanEvent, ScanRequest, Subscription, TrawlConfig,
//! };
//!
//! struct Resolver;
//!
//! #[async_trait]
//! impl Module for Resolver {
//!     fn name(&self) -> &str {
//!         "sfp_dnsresolve"
//!     }
//!
//!     fn consumed_types(&self) -> Subscription {
//!         Subscription::types([EventType::INTERNET_NAME])
//!     }
//!
//!     async fn handle_event(&mut self, event: &Arc<ScanEvent>, ctx: &mut ModuleContext) -> anyhow::Result<()> {
//!         for ip in lookup(event.data()).await? {
//!             ctx.emit(EventType::IP_ADDRESS, ip);
//!         }
//!         Ok(())
//!     }
//! }
//!
//! trawl::logging::init_tracing()?;
//!
//! let registry = ModuleRegistry::new().with_module("sfp_dnsresolve", || Resolver);
//! let controller = ScanController::new(registry, Arc::new(MemoryStore::new()), TrawlConfig::from_env()?);
//!
//! let mut scan = controller.start_scan(ScanRequest::new("example", "example.com")).await?;
//! let status = scan.wait().await;
//! ```
//!
//! ## What This Is Not
//!
//! Trawl ships no probes, no UI and no database. Modules, presentation and a
//! durable [`ScanStore`] belong to the embedding application.

// Core modules
mod bus;
mod config;
mod controller;
mod error;
mod event;
mod module;
mod registry;
mod resolver;
mod scan;
mod store;
mod target;

// Tracing setup for binaries
pub mod logging;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Stress tests (test-only)
#[cfg(test)]
mod stress_tests;

// Re-export event types
pub use event::{Ancestors, EventType, ScanEvent, StoredEvent, MAX_SCORE, ROOT_HASH};

// Re-export module interface
pub use module::{
    Module, ModuleContext, ModuleDescriptor, ModuleOptions, SharedServices, StopFlag,
    Subscription,
};

// Re-export error types
pub use error::{ModuleError, ScanError};

// Re-export bus types
pub use bus::{BusStats, EventBus, ModuleRunner, PublishOutcome};

// Re-export registry and resolver
pub use registry::ModuleRegistry;
pub use resolver::{resolve, ModuleSelection};

// Re-export scan lifecycle types
pub use controller::{ScanController, ScanHandle, ScanRequest, ScanSlot, CONTROLLER};
pub use scan::{LogLevel, ScanId, ScanInstance, ScanLogEntry, ScanStatus};
pub use target::{Target, TargetKind};

// Re-export configuration
pub use config::{
    ConfigOverrides, FailurePolicy, NetworkSettings, TrawlConfig, OPT_DNS_SERVER,
    OPT_FETCH_TIMEOUT, OPT_PROXY, OPT_USER_AGENT,
};

// Re-export persistence types
pub use store::{provenance_chain, MemoryStore, ScanStore, StoreError};

// Re-export commonly used external types
pub use async_trait::async_trait;
