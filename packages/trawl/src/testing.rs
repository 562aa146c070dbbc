//! Testing utilities for scans and modules.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! trawl = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Scripted Modules
//!
//! [`ScriptedModule`] is a configurable module whose behaviour is declared
//! up front. Share a [`Journal`] between several of them to assert on the
//! exact order in which the bus drove them:
//!
//! ```ignore
//! use trawl::testing::{Journal, ScriptedModule};
//!
//! let journal = Journal::new();
//! let registry = ModuleRegistry::new()
//!     .with_module("sfp_dns", {
//!         let journal = journal.clone();
//!         move || ScriptedModule::new("sfp_dns")
//!             .consumes([EventType::INTERNET_NAME])
//!             .produces([EventType::IP_ADDRESS])
//!             .emits_on(EventType::INTERNET_NAME, |_| vec![(EventType::IP_ADDRESS, "10.0.0.1".into())])
//!             .journal(journal.clone())
//!     });
//!
//! // ... run a scan ...
//!
//! assert_eq!(journal.entries(), vec!["sfp_dns <- INTERNET_NAME example.com"]);
//! ```
//!
//! # Waiting for Modules
//!
//! [`EventLatch`] lets a test wait until modules reached a point instead of
//! sleeping.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::Notify;

use crate::error::ModuleError;
use crate::event::{EventType, ScanEvent};
use crate::module::{Module, ModuleContext, ModuleOptions, SharedServices, Subscription};
use crate::target::Target;

// =============================================================================
// Journal
// =============================================================================

/// Ordered record of what scripted modules were asked to do.
///
/// Entries read `"<module> <- <TYPE> <data>"` for delivered events and
/// `"<module> started"` for `start` calls.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Entries written by one module.
    pub fn entries_for(&self, module: &str) -> Vec<String> {
        let prefix = format!("{module} ");
        self.entries()
            .into_iter()
            .filter(|entry| entry.starts_with(&prefix))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Event Latch
// =============================================================================

/// Waits for a counted number of occurrences.
///
/// Tests should wait for meaning, not time: a scripted module decrements the
/// latch when it reaches a point, and the test awaits zero.
///
/// ```ignore
/// let started = shared_latch(1);
/// let module = ScriptedModule::new("sfp_slow").runs_until_stopped(started.clone());
/// // ... start scan ...
/// started.await_zero().await;
/// controller.stop_scan(scan_id)?;
/// ```
#[derive(Debug)]
pub struct EventLatch {
    remaining: AtomicUsize,
    notify: Notify,
}

impl EventLatch {
    pub fn new(expected: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(expected),
            notify: Notify::new(),
        }
    }

    /// Count one occurrence.
    ///
    /// # Panics
    ///
    /// Panics if called more times than expected.
    pub fn dec(&self) {
        let prev = self.remaining.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            panic!("EventLatch decremented below zero - more occurrences than expected");
        }
        if prev == 1 {
            self.notify.notify_waiters();
        }
    }

    /// Wait for the count to reach zero.
    pub async fn await_zero(&self) {
        loop {
            // Register before checking, or a dec() in between is lost.
            let notified = self.notify.notified();
            if self.remaining.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }
}

/// Arc-wrapped [`EventLatch`] for sharing with module factories.
pub type SharedEventLatch = Arc<EventLatch>;

pub fn shared_latch(expected: usize) -> SharedEventLatch {
    Arc::new(EventLatch::new(expected))
}

// =============================================================================
// Scripted Module
// =============================================================================

type Reaction = Arc<dyn Fn(&ScanEvent) -> Vec<(EventType, String)> + Send + Sync>;

/// Slot a scripted module writes its merged options into during setup.
pub type OptionsProbe = Arc<Mutex<Option<ModuleOptions>>>;

/// A module whose behaviour is declared with builder calls.
///
/// Cheap to clone, so a registry factory can hand out copies of one
/// configured instance.
#[derive(Clone)]
pub struct ScriptedModule {
    name: String,
    consumes: Subscription,
    produces: BTreeSet<EventType>,
    defaults: ModuleOptions,
    required_option: Option<String>,
    on_start: Vec<(EventType, String)>,
    reactions: Vec<(EventType, Reaction)>,
    fail_on: Option<EventType>,
    panic_on: Option<EventType>,
    panic_on_setup: bool,
    fail_on_start: bool,
    event_delay: Option<Duration>,
    run_until_stopped: Option<SharedEventLatch>,
    journal: Option<Journal>,
    options_probe: Option<OptionsProbe>,
}

impl ScriptedModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            consumes: Subscription::Nothing,
            produces: BTreeSet::new(),
            defaults: ModuleOptions::new(),
            required_option: None,
            on_start: Vec::new(),
            reactions: Vec::new(),
            fail_on: None,
            panic_on: None,
            panic_on_setup: false,
            fail_on_start: false,
            event_delay: None,
            run_until_stopped: None,
            journal: None,
            options_probe: None,
        }
    }

    pub fn consumes<I, T>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<EventType>,
    {
        self.consumes = Subscription::types(types);
        self
    }

    /// Subscribe to the wildcard.
    pub fn consumes_all(mut self) -> Self {
        self.consumes = Subscription::All;
        self
    }

    pub fn produces<I, T>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<EventType>,
    {
        self.produces = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn default_option(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.defaults.set(key, value);
        self
    }

    /// Fail setup with [`ModuleError::MissingOption`] unless `key` is set.
    pub fn requires_option(mut self, key: impl Into<String>) -> Self {
        self.required_option = Some(key.into());
        self
    }

    /// Publish these events from `start`, parented on ROOT.
    pub fn emits_on_start(mut self, events: Vec<(EventType, String)>) -> Self {
        self.on_start = events;
        self
    }

    /// On receiving `trigger`, publish whatever `reaction` returns.
    pub fn emits_on<F>(mut self, trigger: impl Into<EventType>, reaction: F) -> Self
    where
        F: Fn(&ScanEvent) -> Vec<(EventType, String)> + Send + Sync + 'static,
    {
        self.reactions.push((trigger.into(), Arc::new(reaction)));
        self
    }

    /// Return an error from `handle_event` for this type.
    pub fn fails_on(mut self, trigger: impl Into<EventType>) -> Self {
        self.fail_on = Some(trigger.into());
        self
    }

    pub fn panics_on(mut self, trigger: impl Into<EventType>) -> Self {
        self.panic_on = Some(trigger.into());
        self
    }

    /// Panic inside `setup`.
    pub fn panics_on_setup(mut self) -> Self {
        self.panic_on_setup = true;
        self
    }

    /// Return an error from `start`.
    pub fn fails_on_start(mut self) -> Self {
        self.fail_on_start = true;
        self
    }

    /// Sleep this long inside every `handle_event`.
    pub fn sleeps_on_event(mut self, delay: Duration) -> Self {
        self.event_delay = Some(delay);
        self
    }

    /// Keep `start` running, polling for stop, after decrementing `started`.
    pub fn runs_until_stopped(mut self, started: SharedEventLatch) -> Self {
        self.run_until_stopped = Some(started);
        self
    }

    pub fn journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Record the options `setup` receives.
    pub fn captures_options(mut self, probe: OptionsProbe) -> Self {
        self.options_probe = Some(probe);
        self
    }

    fn record(&self, entry: String) {
        if let Some(journal) = &self.journal {
            journal.record(entry);
        }
    }
}

impl fmt::Debug for ScriptedModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedModule")
            .field("name", &self.name)
            .field("consumes", &self.consumes)
            .field("produces", &self.produces)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Module for ScriptedModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn default_options(&self) -> ModuleOptions {
        self.defaults.clone()
    }

    fn setup(
        &mut self,
        _services: &SharedServices,
        _target: &Target,
        options: &ModuleOptions,
    ) -> Result<(), ModuleError> {
        if self.panic_on_setup {
            panic!("scripted panic in setup of {}", self.name);
        }
        if let Some(probe) = &self.options_probe {
            *probe.lock().unwrap_or_else(|e| e.into_inner()) = Some(options.clone());
        }
        if let Some(key) = &self.required_option {
            options.require_str(key)?;
        }
        Ok(())
    }

    fn consumed_types(&self) -> Subscription {
        self.consumes.clone()
    }

    fn produced_types(&self) -> BTreeSet<EventType> {
        self.produces.clone()
    }

    async fn handle_event(
        &mut self,
        event: &Arc<ScanEvent>,
        ctx: &mut ModuleContext,
    ) -> Result<()> {
        self.record(format!("{} <- {} {}", self.name, event.event_type(), event.data()));

        if let Some(delay) = self.event_delay {
            tokio::time::sleep(delay).await;
        }
        if self.panic_on.as_ref() == Some(event.event_type()) {
            panic!("scripted panic on {}", event.event_type());
        }
        if self.fail_on.as_ref() == Some(event.event_type()) {
            bail!("scripted failure on {}", event.event_type());
        }

        for (trigger, reaction) in &self.reactions {
            if trigger == event.event_type() {
                for (event_type, data) in reaction(event) {
                    ctx.emit(event_type, data);
                }
            }
        }
        Ok(())
    }

    async fn start(&mut self, ctx: &mut ModuleContext) -> Result<()> {
        self.record(format!("{} started", self.name));

        if self.fail_on_start {
            bail!("scripted failure in start");
        }
        for (event_type, data) in &self.on_start {
            ctx.emit(event_type.clone(), data.clone());
        }
        if let Some(started) = &self.run_until_stopped {
            started.dec();
            while !ctx.is_stop_requested() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{StopFlag, SharedServices};
    use crate::scan::ScanId;

    fn context(
        current: Option<Arc<ScanEvent>>,
        root: Arc<ScanEvent>,
        stop: StopFlag,
    ) -> ModuleContext {
        ModuleContext::new(
            ScanId::new(),
            "scripted".into(),
            Arc::new(SharedServices::default()),
            Arc::new(Target::parse("example.com").unwrap()),
            root,
            current,
            StopFlag::new(),
            stop,
        )
    }

    #[test]
    fn test_event_latch_basic() {
        let latch = EventLatch::new(2);
        assert_eq!(latch.remaining(), 2);

        latch.dec();
        assert!(!latch.is_complete());
        latch.dec();
        assert!(latch.is_complete());
    }

    #[test]
    #[should_panic(expected = "decremented below zero")]
    fn test_event_latch_underflow_panics() {
        let latch = EventLatch::new(1);
        latch.dec();
        latch.dec();
    }

    #[tokio::test]
    async fn test_event_latch_await_after_dec() {
        let latch = shared_latch(2);

        let latch_clone = latch.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            latch_clone.dec();
            tokio::time::sleep(Duration::from_millis(10)).await;
            latch_clone.dec();
        });

        latch.await_zero().await;
        assert!(latch.is_complete());
    }

    #[tokio::test]
    async fn test_scripted_reactions_and_journal() {
        let journal = Journal::new();
        let mut module = ScriptedModule::new("sfp_dns")
            .consumes([EventType::INTERNET_NAME])
            .emits_on(EventType::INTERNET_NAME, |e| {
                vec![(EventType::IP_ADDRESS, format!("ip-of-{}", e.data()))]
            })
            .journal(journal.clone());

        let root = Arc::new(ScanEvent::root("example.com"));
        let name = Arc::new(ScanEvent::new(EventType::INTERNET_NAME, "example.com", "seed", &root));
        let mut ctx = context(Some(Arc::clone(&name)), root, StopFlag::new());

        module.handle_event(&name, &mut ctx).await.unwrap();

        let out = ctx.take_outbox();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].data(), "ip-of-example.com");
        assert_eq!(out[0].source_hash(), name.hash());
        assert_eq!(journal.entries(), vec!["sfp_dns <- INTERNET_NAME example.com"]);
        assert_eq!(journal.entries_for("sfp_dns").len(), 1);
    }

    #[test]
    fn test_required_option_fails_setup() {
        let probe = OptionsProbe::default();
        let mut module = ScriptedModule::new("sfp_api")
            .requires_option("api_key")
            .captures_options(probe.clone());
        let target = Target::parse("example.com").unwrap();

        let err = module
            .setup(&SharedServices::default(), &target, &ModuleOptions::new())
            .unwrap_err();
        assert!(matches!(err, ModuleError::MissingOption(key) if key == "api_key"));
        assert!(probe.lock().unwrap().is_some());

        let options: ModuleOptions = [("api_key", "secret")].into_iter().collect();
        module.setup(&SharedServices::default(), &target, &options).unwrap();
    }

    #[tokio::test]
    async fn test_runs_until_stopped() {
        let started = shared_latch(1);
        let mut module = ScriptedModule::new("sfp_slow").runs_until_stopped(started.clone());
        let stop = StopFlag::new();
        let root = Arc::new(ScanEvent::root("example.com"));
        let mut ctx = context(None, root, stop.clone());

        let task = tokio::spawn(async move { module.start(&mut ctx).await });
        started.await_zero().await;
        assert!(!task.is_finished());

        stop.request();
        task.await.unwrap().unwrap();
    }
}
