//! The module interface every probe implements, and the context it runs in.
//!
//! A module declares what it listens to ([`Subscription`]) and what it may
//! produce, gets configured once through [`Module::setup`], and is then
//! driven by the bus:
//!
//! - [`Module::start`] runs once per scan, for modules that generate events
//!   without input (seeding a crawl, say). Most modules leave it as a no-op.
//! - [`Module::handle_event`] runs for every published event the
//!   subscription matches, including events the module published itself.
//!
//! Both receive a [`ModuleContext`]. Events published through the context
//! are delivered once the call returns, depth first.
//!
//! # Cancellation
//!
//! Stopping is cooperative. The controller sets a stop flag; a module with a
//! loop longer than a single network call polls
//! [`ModuleContext::is_stop_requested`] and returns early.
//!
//! # Example
//!
//! ```ignore
//! use trawl::{async_trait, EventType, Module, ModuleContext, ScanEvent, Subscription};
//!
//! struct ReverseResolve;
//!
//! #[async_trait]
//! impl Module for ReverseResolve {
//!     fn name(&self) -> &str {
//!         "sfp_reverse"
//!     }
//!
//!     fn consumed_types(&self) -> Subscription {
//!         Subscription::types([EventType::IP_ADDRESS])
//!     }
//!
//!     fn produced_types(&self) -> BTreeSet<EventType> {
//!         [EventType::INTERNET_NAME].into()
//!     }
//!
//!     async fn handle_event(&mut self, event: &Arc<ScanEvent>, ctx: &mut ModuleContext) -> anyhow::Result<()> {
//!         for name in lookup_ptr(event.data()).await {
//!             if ctx.is_stop_requested() {
//!                 break;
//!             }
//!             ctx.emit(EventType::INTERNET_NAME, name);
//!         }
//!         Ok(())
//!     }
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::NetworkSettings;
use crate::error::ModuleError;
use crate::event::{EventType, ScanEvent};
use crate::scan::ScanId;
use crate::target::Target;

// =============================================================================
// Subscription
// =============================================================================

/// Which event types a module wants delivered.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Subscription {
    /// Purely generative; takes no event input.
    #[default]
    Nothing,
    /// The `*` wildcard.
    All,
    /// An explicit set of types.
    Types(BTreeSet<EventType>),
}

impl Subscription {
    /// Subscribe to a set of types. An empty set means [`Subscription::Nothing`].
    pub fn types<I, T>(types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<EventType>,
    {
        let set: BTreeSet<EventType> = types.into_iter().map(Into::into).collect();
        if set.is_empty() {
            Subscription::Nothing
        } else {
            Subscription::Types(set)
        }
    }

    /// Whether an event of this type should be delivered.
    pub fn matches(&self, event_type: &EventType) -> bool {
        match self {
            Subscription::Nothing => false,
            Subscription::All => true,
            Subscription::Types(set) => set.contains(event_type),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Subscription::Nothing)
    }
}

// =============================================================================
// Module Options
// =============================================================================

/// Key/value module configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModuleOptions(BTreeMap<String, Value>);

impl ModuleOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(Value::as_u64)
    }

    /// Read a whole number of seconds.
    pub fn get_duration(&self, key: &str) -> Option<Duration> {
        self.get_u64(key).map(Duration::from_secs)
    }

    /// Read a string option or fail setup with [`ModuleError::MissingOption`].
    pub fn require_str(&self, key: &str) -> Result<&str, ModuleError> {
        self.get_str(key)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| ModuleError::MissingOption(key.to_string()))
    }

    /// Copy every key of `other` over this one.
    pub fn merge(&mut self, other: &ModuleOptions) {
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for ModuleOptions {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

// =============================================================================
// Shared Services
// =============================================================================

/// Facilities the controller owns and lends to every module of a scan.
#[derive(Debug, Clone, Default)]
pub struct SharedServices {
    network: NetworkSettings,
}

impl SharedServices {
    pub fn new(network: NetworkSettings) -> Self {
        Self { network }
    }

    pub fn network(&self) -> &NetworkSettings {
        &self.network
    }
}

// =============================================================================
// Stop Flag
// =============================================================================

/// Cooperative cancellation flag. Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Module Context
// =============================================================================

/// What a module sees while the bus runs it.
///
/// A fresh context is built for every call. Events published through it are
/// held until the call returns, then handed to the bus in publish order.
pub struct ModuleContext {
    scan_id: ScanId,
    module: String,
    services: Arc<SharedServices>,
    target: Arc<Target>,
    root: Arc<ScanEvent>,
    current: Option<Arc<ScanEvent>>,
    module_stop: StopFlag,
    scan_stop: StopFlag,
    outbox: Vec<ScanEvent>,
}

impl ModuleContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        scan_id: ScanId,
        module: String,
        services: Arc<SharedServices>,
        target: Arc<Target>,
        root: Arc<ScanEvent>,
        current: Option<Arc<ScanEvent>>,
        module_stop: StopFlag,
        scan_stop: StopFlag,
    ) -> Self {
        Self {
            scan_id,
            module,
            services,
            target,
            root,
            current,
            module_stop,
            scan_stop,
            outbox: Vec::new(),
        }
    }

    /// Queue an event for publishing.
    ///
    /// Returns `false`, and drops the event, when its data is empty.
    pub fn publish(&mut self, event: ScanEvent) -> bool {
        if event.data().is_empty() {
            return false;
        }
        self.outbox.push(event);
        true
    }

    /// Publish a new event from this module, caused by the event being
    /// handled (or by ROOT during `start`).
    pub fn emit(&mut self, event_type: impl Into<EventType>, data: impl Into<String>) -> bool {
        let parent = self.current.clone().unwrap_or_else(|| Arc::clone(&self.root));
        let event = ScanEvent::new(event_type, data, self.module.clone(), &parent);
        self.publish(event)
    }

    /// Whether this module or the whole scan was asked to stop.
    pub fn is_stop_requested(&self) -> bool {
        self.module_stop.is_requested() || self.scan_stop.is_requested()
    }

    pub fn scan_id(&self) -> ScanId {
        self.scan_id
    }

    pub fn module_name(&self) -> &str {
        &self.module
    }

    pub fn services(&self) -> &SharedServices {
        &self.services
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// The scan's ROOT event.
    pub fn root(&self) -> &Arc<ScanEvent> {
        &self.root
    }

    /// The event being handled; `None` inside `start`.
    pub fn current_event(&self) -> Option<&Arc<ScanEvent>> {
        self.current.as_ref()
    }

    pub(crate) fn take_outbox(&mut self) -> Vec<ScanEvent> {
        std::mem::take(&mut self.outbox)
    }
}

impl fmt::Debug for ModuleContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleContext")
            .field("scan_id", &self.scan_id)
            .field("module", &self.module)
            .field("queued", &self.outbox.len())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Module Trait
// =============================================================================

/// A probe: one kind of discovery behind the subscribe/publish interface.
///
/// # Guarantees
///
/// - `setup` is called exactly once, before any other call.
/// - `consumed_types` is read once at wiring time and must not change.
/// - `start` is called once, after the seed events have been delivered.
/// - Calls never overlap: the bus awaits each call before the next.
///
/// # Errors
///
/// A `setup` error aborts the scan before it starts. An error returned from
/// `handle_event` or `start` ends the scan as `ERROR-FAILED` unless the scan
/// runs with `FailurePolicy::Isolate`. Expected network failures (timeouts,
/// NXDOMAIN, HTTP errors) belong inside the module and should simply produce
/// fewer events.
#[async_trait]
pub trait Module: Send + 'static {
    /// Unique module name, e.g. `sfp_dnsresolve`.
    fn name(&self) -> &str;

    /// Option values used when neither global nor per-scan config sets them.
    fn default_options(&self) -> ModuleOptions {
        ModuleOptions::new()
    }

    /// One-time initialisation with merged options.
    fn setup(
        &mut self,
        _services: &SharedServices,
        _target: &Target,
        _options: &ModuleOptions,
    ) -> Result<(), ModuleError> {
        Ok(())
    }

    /// Event types this module wants to receive.
    fn consumed_types(&self) -> Subscription;

    /// Event types this module may publish. Advisory: used by the resolver,
    /// never checked at publish time.
    fn produced_types(&self) -> BTreeSet<EventType> {
        BTreeSet::new()
    }

    /// Handle one delivered event.
    async fn handle_event(
        &mut self,
        event: &Arc<ScanEvent>,
        ctx: &mut ModuleContext,
    ) -> Result<()>;

    /// Generate events without input. No-op by default.
    async fn start(&mut self, _ctx: &mut ModuleContext) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Module Descriptor
// =============================================================================

/// Static facts about a module, as the resolver and the registry see them.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleDescriptor {
    pub name: String,
    pub consumed: Subscription,
    pub produced: BTreeSet<EventType>,
    pub options: ModuleOptions,
}

impl ModuleDescriptor {
    /// Read the descriptor off a module instance.
    pub fn of(module: &dyn Module) -> Self {
        Self {
            name: module.name().to_string(),
            consumed: module.consumed_types(),
            produced: module.produced_types(),
            options: module.default_options(),
        }
    }
}
