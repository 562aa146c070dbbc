//! Event bus: fans published events out to subscribed modules.
//!
//! # Delivery
//!
//! For every published event the bus
//!
//! 1. drops it if its data is empty,
//! 2. walks its ancestors; if one carries the same type and data (ignoring
//!    case) the event is **store-only**,
//! 3. stores it,
//! 4. unless store-only, calls `handle_event` on every listener whose
//!    subscription matches, in module-name order, skipping modules that were
//!    asked to stop.
//!
//! Step 2 is what keeps self-subscribed modules, and pairs of modules that
//! rediscover each other's output, from looping forever.
//!
//! # Ordering
//!
//! Delivery is depth first. Events a module publishes during a call are
//! processed, with their whole downstream fan-out, before the bus moves on to
//! the next listener of the event that caused them:
//!
//! ```text
//! publish(A) ─► M1.handle(A) publishes B, C
//!               ├─ store B ─► M2.handle(B) ─► …
//!               ├─ store C ─► M2.handle(C) ─► …
//!               └─ M2.handle(A)
//! ```
//!
//! The bus keeps an explicit LIFO work-list instead of recursing, so deep
//! provenance chains cost heap, not stack.
//!
//! # Failures
//!
//! Under [`FailurePolicy::Abort`] an error or panic escaping a module ends the
//! dispatch with [`ScanError::ModuleFailed`]. Under
//! [`FailurePolicy::Isolate`] the module is put into error state, receives
//! nothing further, and dispatch carries on.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use smallvec::SmallVec;
use tracing::{debug, error, trace, warn};

use crate::config::FailurePolicy;
use crate::error::ScanError;
use crate::event::ScanEvent;
use crate::module::{Module, ModuleContext, SharedServices, StopFlag, Subscription};
use crate::scan::{LogLevel, ScanId, ScanLogEntry};
use crate::store::ScanStore;
use crate::target::Target;

type Recipients = SmallVec<[usize; 8]>;

// =============================================================================
// Module Runner
// =============================================================================

/// A module instance as the bus holds it: the module, its subscription as
/// read at wiring time, its stop flag and its error state.
pub struct ModuleRunner {
    module: Box<dyn Module>,
    name: String,
    subscription: Subscription,
    stop: StopFlag,
    failed: bool,
}

impl ModuleRunner {
    /// Wrap a module under its own name.
    pub fn new(module: Box<dyn Module>) -> Self {
        let name = module.name().to_string();
        Self::with_name(module, name)
    }

    /// Wrap a module under a given name (the registry name).
    pub fn with_name(module: Box<dyn Module>, name: impl Into<String>) -> Self {
        let subscription = module.consumed_types();
        Self {
            module,
            name: name.into(),
            subscription,
            stop: StopFlag::new(),
            failed: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    /// A handle on this module's stop flag, usable from other tasks.
    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    pub fn request_stop(&self) {
        self.stop.request();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.is_requested()
    }

    /// Whether the module was isolated after a failure.
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub(crate) fn module_mut(&mut self) -> &mut dyn Module {
        self.module.as_mut()
    }
}

impl std::fmt::Debug for ModuleRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRunner")
            .field("name", &self.name)
            .field("subscription", &self.subscription)
            .field("stop_requested", &self.is_stop_requested())
            .field("failed", &self.failed)
            .finish()
    }
}

// =============================================================================
// Outcomes and Stats
// =============================================================================

/// What happened to a published event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Empty data; nothing stored.
    Rejected,
    /// Stored, delivery suppressed by the cycle check.
    StoredOnly,
    /// Stored and handed to this many listeners.
    Delivered {
        /// Listeners whose subscription matched.
        recipients: usize,
    },
}

/// Running counters for one bus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    pub stored: usize,
    pub rejected: usize,
    pub store_only: usize,
    pub deliveries: usize,
    pub skipped_stopped: usize,
    pub module_failures: usize,
}

enum Frame {
    /// Published but not yet checked or stored.
    Pending(Arc<ScanEvent>),
    /// Stored; `recipients[next..]` still to be called.
    Delivering {
        event: Arc<ScanEvent>,
        recipients: Recipients,
        next: usize,
    },
}

// =============================================================================
// Event Bus
// =============================================================================

/// The per-scan event bus.
pub struct EventBus {
    scan_id: ScanId,
    store: Arc<dyn ScanStore>,
    services: Arc<SharedServices>,
    target: Arc<Target>,
    root: Arc<ScanEvent>,
    runners: Vec<ModuleRunner>,
    /// Indices into `runners` of modules with a subscription, by name.
    listeners: Vec<usize>,
    stop: StopFlag,
    policy: FailurePolicy,
    handler_timeout: Option<Duration>,
    stats: BusStats,
}

impl EventBus {
    /// Create a bus for one scan. `root` must be the scan's ROOT event.
    pub fn new(
        scan_id: ScanId,
        store: Arc<dyn ScanStore>,
        services: Arc<SharedServices>,
        target: Arc<Target>,
        root: Arc<ScanEvent>,
    ) -> Self {
        Self {
            scan_id,
            store,
            services,
            target,
            root,
            runners: Vec::new(),
            listeners: Vec::new(),
            stop: StopFlag::new(),
            policy: FailurePolicy::default(),
            handler_timeout: None,
            stats: BusStats::default(),
        }
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Bound every module call. Exceeding it counts as a module failure.
    pub fn with_handler_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// Share an existing stop flag as the bus-wide flag.
    pub fn with_stop_flag(mut self, stop: StopFlag) -> Self {
        self.stop = stop;
        self
    }

    /// Register a module. Modules with a non-empty subscription become
    /// listeners; a module may listen to its own output.
    pub fn register(&mut self, runner: ModuleRunner) {
        let index = self.runners.len();
        let listens = !runner.subscription().is_empty();
        debug!(
            scan_id = %self.scan_id,
            module = runner.name(),
            listens,
            "module wired to bus"
        );
        self.runners.push(runner);
        if listens {
            self.listeners.push(index);
            let runners = &self.runners;
            self.listeners
                .sort_by(|a, b| runners[*a].name().cmp(runners[*b].name()));
        }
    }

    pub fn scan_id(&self) -> ScanId {
        self.scan_id
    }

    pub fn root(&self) -> &Arc<ScanEvent> {
        &self.root
    }

    pub fn runners(&self) -> &[ModuleRunner] {
        &self.runners
    }

    /// Listener names in delivery order.
    pub fn listener_names(&self) -> Vec<&str> {
        self.listeners
            .iter()
            .map(|&i| self.runners[i].name())
            .collect()
    }

    pub fn stats(&self) -> BusStats {
        self.stats
    }

    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    /// Ask every module, and the bus itself, to stop.
    pub fn request_stop(&self) {
        self.stop.request();
        for runner in &self.runners {
            runner.request_stop();
        }
    }

    /// Whether the bus or any module was asked to stop.
    pub fn stop_requested(&self) -> bool {
        self.stop.is_requested() || self.runners.iter().any(ModuleRunner::is_stop_requested)
    }

    /// Store the ROOT event and deliver it to its listeners.
    pub async fn publish_root(&mut self) -> Result<PublishOutcome, ScanError> {
        let root = Arc::clone(&self.root);
        self.dispatch(root).await
    }

    /// Publish an event and drain its whole downstream fan-out.
    pub async fn publish(&mut self, event: ScanEvent) -> Result<PublishOutcome, ScanError> {
        self.dispatch(Arc::new(event)).await
    }

    /// Run one module's `start()` and drain everything it publishes.
    ///
    /// A module isolated after an earlier failure is not started.
    pub async fn start_module(&mut self, index: usize) -> Result<(), ScanError> {
        match self.runners.get(index) {
            None => return Ok(()),
            Some(runner) if runner.is_failed() => {
                debug!(
                    scan_id = %self.scan_id,
                    module = runner.name(),
                    "skipping start of failed module"
                );
                return Ok(());
            }
            Some(_) => {}
        }
        debug!(
            scan_id = %self.scan_id,
            module = self.runners[index].name(),
            "starting module"
        );
        let published = self.invoke(index, None).await?;
        let mut stack = Vec::with_capacity(published.len());
        push_pending(&mut stack, published);
        self.run(stack).await
    }

    async fn dispatch(&mut self, event: Arc<ScanEvent>) -> Result<PublishOutcome, ScanError> {
        let mut stack = Vec::new();
        let outcome = self.accept(event, &mut stack).await?;
        self.run(stack).await?;
        Ok(outcome)
    }

    /// Steps 1-3: reject, cycle check, store. Queues delivery when due.
    async fn accept(
        &mut self,
        event: Arc<ScanEvent>,
        stack: &mut Vec<Frame>,
    ) -> Result<PublishOutcome, ScanError> {
        if event.data().is_empty() {
            self.stats.rejected += 1;
            trace!(
                scan_id = %self.scan_id,
                event_type = %event.event_type(),
                "empty event dropped"
            );
            return Ok(PublishOutcome::Rejected);
        }

        let store_only = event.ancestors().any(|ancestor| ancestor.same_fact(&event));

        self.store.store_event(self.scan_id, &event).await?;
        self.stats.stored += 1;

        if store_only {
            self.stats.store_only += 1;
            debug!(
                scan_id = %self.scan_id,
                event_type = %event.event_type(),
                module = event.module(),
                "fact already in ancestry, stored without delivery"
            );
            return Ok(PublishOutcome::StoredOnly);
        }

        let recipients: Recipients = self
            .listeners
            .iter()
            .copied()
            .filter(|&i| {
                let runner = &self.runners[i];
                !runner.failed && runner.subscription.matches(event.event_type())
            })
            .collect();

        let count = recipients.len();
        trace!(
            scan_id = %self.scan_id,
            event_type = %event.event_type(),
            recipients = count,
            "event stored"
        );
        if count > 0 {
            stack.push(Frame::Delivering {
                event,
                recipients,
                next: 0,
            });
        }
        Ok(PublishOutcome::Delivered { recipients: count })
    }

    /// Drain the work-list.
    async fn run(&mut self, mut stack: Vec<Frame>) -> Result<(), ScanError> {
        while let Some(frame) = stack.pop() {
            match frame {
                Frame::Pending(event) => {
                    self.accept(event, &mut stack).await?;
                }
                Frame::Delivering {
                    event,
                    recipients,
                    next,
                } => {
                    let Some(&index) = recipients.get(next) else {
                        continue;
                    };
                    stack.push(Frame::Delivering {
                        event: Arc::clone(&event),
                        recipients,
                        next: next + 1,
                    });

                    let (failed, stopped) = {
                        let runner = &self.runners[index];
                        (runner.failed, runner.is_stop_requested())
                    };
                    if failed {
                        continue;
                    }
                    if stopped || self.stop.is_requested() {
                        self.stats.skipped_stopped += 1;
                        continue;
                    }

                    self.stats.deliveries += 1;
                    let published = self.invoke(index, Some(event)).await?;
                    push_pending(&mut stack, published);
                }
            }
        }
        Ok(())
    }

    /// Call one module, turning errors, panics and timeouts into
    /// [`ScanError`] and applying the failure policy.
    async fn invoke(
        &mut self,
        index: usize,
        event: Option<Arc<ScanEvent>>,
    ) -> Result<Vec<ScanEvent>, ScanError> {
        let timeout = self.handler_timeout;
        let runner = &mut self.runners[index];
        let name = runner.name.clone();
        let mut ctx = ModuleContext::new(
            self.scan_id,
            name.clone(),
            Arc::clone(&self.services),
            Arc::clone(&self.target),
            Arc::clone(&self.root),
            event.clone(),
            runner.stop.clone(),
            self.stop.clone(),
        );

        let module = runner.module_mut();
        let call = async {
            match &event {
                Some(event) => module.handle_event(event, &mut ctx).await,
                None => module.start(&mut ctx).await,
            }
        };
        let guarded = AssertUnwindSafe(call).catch_unwind();

        let failure = match timeout {
            Some(limit) => match tokio::time::timeout(limit, guarded).await {
                Ok(result) => call_failure(&name, result),
                Err(_) => Some(ScanError::ModuleTimeout {
                    module: name.clone(),
                    duration: limit,
                }),
            },
            None => call_failure(&name, guarded.await),
        };

        let published = ctx.take_outbox();
        let Some(failure) = failure else {
            return Ok(published);
        };

        self.stats.module_failures += 1;
        match self.policy {
            FailurePolicy::Abort => {
                error!(
                    scan_id = %self.scan_id,
                    module = %name,
                    error = %failure,
                    "module failed, aborting scan"
                );
                Err(failure)
            }
            FailurePolicy::Isolate => {
                warn!(
                    scan_id = %self.scan_id,
                    module = %name,
                    error = %failure,
                    "module failed, isolating it"
                );
                self.runners[index].failed = true;
                self.store
                    .log_scan_event(
                        self.scan_id,
                        ScanLogEntry::new(LogLevel::Error, name, failure.to_string()),
                    )
                    .await?;
                Ok(published)
            }
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("scan_id", &self.scan_id)
            .field("modules", &self.runners.len())
            .field("listeners", &self.listener_names())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

/// Queue published events so the first one published is processed first.
fn push_pending(stack: &mut Vec<Frame>, published: Vec<ScanEvent>) {
    stack.extend(
        published
            .into_iter()
            .rev()
            .map(|event| Frame::Pending(Arc::new(event))),
    );
}

fn call_failure(
    module: &str,
    result: Result<anyhow::Result<()>, Box<dyn std::any::Any + Send>>,
) -> Option<ScanError> {
    match result {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(ScanError::ModuleFailed {
            module: module.to_string(),
            message: format!("{e:#}"),
        }),
        Err(panic_info) => Some(ScanError::ModuleFailed {
            module: module.to_string(),
            message: format!("panicked: {}", panic_message(panic_info.as_ref())),
        }),
    }
}

/// The payload of a caught panic as text.
pub(crate) fn panic_message(panic_info: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
