//! Scan controller: owns the scan lifecycle.
//!
//! ```text
//! start_scan()                      spawned scan task
//! ─────────────────────────────     ───────────────────────────────────────────
//! CREATED                           STARTING ─ wire ─┬─ stop? ─► ABORTING ─► ABORTED
//!   merge config, persist                            │
//!   instantiate + setup modules                      ├─ ROOT, seed events
//!   (setup error: stays CREATED)                     ├─ RUNNING
//!                                                    ├─ start() each module
//!                                                    └─► FINISHED | ABORTED
//!                                   any error ──────────► ERROR-FAILED
//! ```
//!
//! One scan runs at a time in the whole process. The slot is taken when
//! `start_scan` begins and released once the terminal status is persisted; a
//! second `start_scan` in between, on any controller sharing the slot, is
//! refused with [`ScanError::ScanAlreadyRunning`].

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::{panic_message, EventBus, ModuleRunner};
use crate::config::{ConfigOverrides, TrawlConfig};
use crate::error::{ModuleError, ScanError};
use crate::event::{EventType, ScanEvent};
use crate::module::{SharedServices, StopFlag};
use crate::registry::ModuleRegistry;
use crate::resolver::ModuleSelection;
use crate::scan::{LogLevel, ScanId, ScanInstance, ScanLogEntry, ScanStatus};
use crate::store::ScanStore;
use crate::target::Target;

/// Module name recorded on the seed events and on controller log lines.
pub const CONTROLLER: &str = "controller";

// =============================================================================
// Scan Request
// =============================================================================

/// Everything needed to start a scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRequest {
    pub name: String,
    pub target: String,
    #[serde(default)]
    pub modules: ModuleSelection,
    #[serde(default)]
    pub overrides: ConfigOverrides,
}

impl ScanRequest {
    /// A request running every registered module with no overrides.
    pub fn new(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            modules: ModuleSelection::All,
            overrides: ConfigOverrides::default(),
        }
    }

    pub fn with_modules(mut self, modules: ModuleSelection) -> Self {
        self.modules = modules;
        self
    }

    pub fn with_overrides(mut self, overrides: ConfigOverrides) -> Self {
        self.overrides = overrides;
        self
    }
}

// =============================================================================
// Active Slot
// =============================================================================

/// The scan currently holding the slot, and the flags that stop it.
#[derive(Debug)]
struct ActiveScan {
    id: ScanId,
    bus_stop: StopFlag,
    module_stops: Vec<StopFlag>,
}

impl ActiveScan {
    fn request_stop(&self) {
        for flag in &self.module_stops {
            flag.request();
        }
        self.bus_stop.request();
    }
}

/// The single-flight slot. Controllers holding clones of the same slot
/// never run scans at the same time.
///
/// [`ScanController::new`] uses [`ScanSlot::process`], so every controller in
/// the process shares one slot. A private slot from [`ScanSlot::new`] scopes
/// single-flight to the controllers it is handed to.
#[derive(Debug, Clone, Default)]
pub struct ScanSlot {
    inner: Arc<Mutex<Option<ActiveScan>>>,
}

static PROCESS_SLOT: OnceLock<ScanSlot> = OnceLock::new();

impl ScanSlot {
    /// A fresh slot shared by nobody yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// The slot shared by every controller built with [`ScanController::new`].
    pub fn process() -> Self {
        PROCESS_SLOT.get_or_init(ScanSlot::new).clone()
    }

    /// Id of the scan holding the slot, if any.
    pub fn active(&self) -> Option<ScanId> {
        self.lock().as_ref().map(|a| a.id)
    }

    /// True when both handles refer to the same slot.
    pub fn same_slot(&self, other: &ScanSlot) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn lock(&self) -> MutexGuard<'_, Option<ActiveScan>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Releases the slot when dropped, including on early return and panic.
struct SlotGuard {
    slot: ScanSlot,
    id: ScanId,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut active = self.slot.lock();
        if active.as_ref().map(|a| a.id) == Some(self.id) {
            *active = None;
        }
    }
}

// =============================================================================
// Scan Handle
// =============================================================================

/// Handle to a started scan.
#[derive(Debug)]
pub struct ScanHandle {
    id: ScanId,
    status: watch::Receiver<ScanStatus>,
    task: JoinHandle<()>,
}

impl ScanHandle {
    pub fn id(&self) -> ScanId {
        self.id
    }

    /// Latest status the scan task reported.
    pub fn status(&self) -> ScanStatus {
        *self.status.borrow()
    }

    /// Wait for the scan to reach a terminal status.
    ///
    /// The slot is already released when this returns.
    pub async fn wait(&mut self) -> ScanStatus {
        loop {
            let current = *self.status.borrow_and_update();
            if current.is_terminal() {
                return current;
            }
            if self.status.changed().await.is_err() {
                // Task gone without a terminal status: it panicked.
                return *self.status.borrow();
            }
        }
    }

    /// Abort the scan task outright. Prefer
    /// [`ScanController::stop_scan`]; this is for test teardown.
    pub fn abort(&self) {
        self.task.abort();
    }
}

// =============================================================================
// Scan Controller
// =============================================================================

/// Starts, stops and reports on scans.
pub struct ScanController {
    registry: Arc<ModuleRegistry>,
    store: Arc<dyn ScanStore>,
    config: TrawlConfig,
    slot: ScanSlot,
}

impl ScanController {
    pub fn new(registry: ModuleRegistry, store: Arc<dyn ScanStore>, config: TrawlConfig) -> Self {
        Self {
            registry: Arc::new(registry),
            store,
            config,
            slot: ScanSlot::process(),
        }
    }

    /// Use `slot` for single-flight instead of the process-wide one.
    pub fn with_slot(mut self, slot: ScanSlot) -> Self {
        self.slot = slot;
        self
    }

    pub fn slot(&self) -> &ScanSlot {
        &self.slot
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn ScanStore> {
        &self.store
    }

    pub fn config(&self) -> &TrawlConfig {
        &self.config
    }

    /// Id of the scan holding the slot, if any.
    pub fn active_scan(&self) -> Option<ScanId> {
        self.slot.active()
    }

    /// Stored status of any scan.
    pub async fn status(&self, scan_id: ScanId) -> Result<ScanStatus, ScanError> {
        self.store
            .scan_instance(scan_id)
            .await?
            .map(|instance| instance.status)
            .ok_or(ScanError::ScanNotActive { scan_id })
    }

    /// Ask the active scan to stop. Modules see the flag at their next poll;
    /// nothing is interrupted.
    pub fn stop_scan(&self, scan_id: ScanId) -> Result<(), ScanError> {
        let active = self.slot.lock();
        match active.as_ref() {
            Some(scan) if scan.id == scan_id => {
                info!(scan_id = %scan_id, modules = scan.module_stops.len(), "stop requested");
                scan.request_stop();
                Ok(())
            }
            _ => Err(ScanError::ScanNotActive { scan_id }),
        }
    }

    /// Create, configure and launch a scan.
    ///
    /// Returns once every module has been set up and the scan task is
    /// spawned. Configuration and setup errors are returned here and leave
    /// the scan in `CREATED`.
    pub async fn start_scan(&self, request: ScanRequest) -> Result<ScanHandle, ScanError> {
        let scan_id = ScanId::new();
        let bus_stop = StopFlag::new();
        {
            let mut active = self.slot.lock();
            if let Some(current) = active.as_ref() {
                warn!(active = %current.id, "scan refused, another scan is active");
                return Err(ScanError::ScanAlreadyRunning { active: current.id });
            }
            *active = Some(ActiveScan {
                id: scan_id,
                bus_stop: bus_stop.clone(),
                module_stops: Vec::new(),
            });
        }
        let guard = SlotGuard {
            slot: self.slot.clone(),
            id: scan_id,
        };

        let target = Target::parse(&request.target)?;
        let config = self.config.with_overrides(&request.overrides)?;

        self.store
            .create_scan_instance(&ScanInstance::new(scan_id, &request.name, target.value()))
            .await?;
        let snapshot =
            serde_json::to_value(&config).map_err(|e| ScanError::Config(e.to_string()))?;
        self.store.store_scan_config(scan_id, &snapshot).await?;
        info!(
            scan_id = %scan_id,
            name = %request.name,
            target = %target.value(),
            kind = %target.kind(),
            "scan created"
        );

        let services = Arc::new(SharedServices::new(config.network.clone()));
        let runners = match self.instantiate(
            scan_id,
            &request.modules,
            &config,
            &services,
            &target,
        ) {
            Ok(runners) => runners,
            Err(err) => {
                error!(scan_id = %scan_id, error = %err, "scan setup failed");
                self.store
                    .log_scan_event(
                        scan_id,
                        ScanLogEntry::new(
                            LogLevel::Error,
                            err.module().unwrap_or(CONTROLLER),
                            err.to_string(),
                        ),
                    )
                    .await?;
                return Err(err);
            }
        };

        if let Some(active) = self.slot.lock().as_mut() {
            active.module_stops = runners.iter().map(ModuleRunner::stop_flag).collect();
        }

        let target = Arc::new(target);
        let root = Arc::new(ScanEvent::root(target.value()));
        let bus = EventBus::new(
            scan_id,
            Arc::clone(&self.store),
            services,
            Arc::clone(&target),
            root,
        )
        .with_policy(config.failure_policy)
        .with_handler_timeout(config.handler_timeout)
        .with_stop_flag(bus_stop);

        let (status_tx, status_rx) = watch::channel(ScanStatus::Created);
        let run = ScanRun {
            scan_id,
            store: Arc::clone(&self.store),
            bus,
            runners,
            target,
            status: ScanStatus::Created,
            status_tx,
        };
        let task = tokio::spawn(run.execute(guard));

        Ok(ScanHandle {
            id: scan_id,
            status: status_rx,
            task,
        })
    }

    fn instantiate(
        &self,
        scan_id: ScanId,
        selection: &ModuleSelection,
        config: &TrawlConfig,
        services: &SharedServices,
        target: &Target,
    ) -> Result<Vec<ModuleRunner>, ScanError> {
        let descriptors =
            std::panic::catch_unwind(AssertUnwindSafe(|| self.registry.descriptors()))
                .map_err(|panic_info| setup_panic(CONTROLLER, panic_info))?;
        let names = selection.select(&descriptors)?;

        let mut runners = Vec::with_capacity(names.len());
        for name in names {
            // Factory, setup() and the subscription read all run module code.
            let runner = std::panic::catch_unwind(AssertUnwindSafe(|| {
                let mut module = self.registry.instantiate(&name)?;
                let options = config.options_for(&name, &module.default_options());
                module
                    .setup(services, target, &options)
                    .map_err(|source| ScanError::ModuleSetup {
                        module: name.clone(),
                        source,
                    })?;
                debug!(
                    scan_id = %scan_id,
                    module = %name,
                    options = options.len(),
                    "module set up"
                );
                Ok::<_, ScanError>(ModuleRunner::with_name(module, name.clone()))
            }))
            .map_err(|panic_info| setup_panic(&name, panic_info))??;
            runners.push(runner);
        }
        Ok(runners)
    }
}

fn setup_panic(module: &str, panic_info: Box<dyn std::any::Any + Send>) -> ScanError {
    ScanError::ModuleSetup {
        module: module.to_string(),
        source: ModuleError::Other(format!(
            "panicked: {}",
            panic_message(panic_info.as_ref())
        )),
    }
}

impl std::fmt::Debug for ScanController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanController")
            .field("registry", &self.registry)
            .field("active_scan", &self.active_scan())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Scan Task
// =============================================================================

struct ScanRun {
    scan_id: ScanId,
    store: Arc<dyn ScanStore>,
    bus: EventBus,
    runners: Vec<ModuleRunner>,
    target: Arc<Target>,
    status: ScanStatus,
    status_tx: watch::Sender<ScanStatus>,
}

impl ScanRun {
    async fn execute(mut self, guard: SlotGuard) {
        let terminal = match self.drive().await {
            Ok(status) => status,
            Err(err) => {
                error!(scan_id = %self.scan_id, error = %err, "scan failed");
                let component = err.module().unwrap_or(CONTROLLER).to_string();
                if let Err(log_err) = self
                    .store
                    .log_scan_event(
                        self.scan_id,
                        ScanLogEntry::new(LogLevel::Error, component, err.to_string()),
                    )
                    .await
                {
                    warn!(scan_id = %self.scan_id, error = %log_err, "could not write scan log");
                }
                ScanStatus::ErrorFailed
            }
        };

        if let Err(err) = self.persist(terminal).await {
            warn!(scan_id = %self.scan_id, error = %err, "could not persist terminal status");
        }
        let stats = self.bus.stats();
        info!(
            scan_id = %self.scan_id,
            status = %terminal,
            stored = stats.stored,
            deliveries = stats.deliveries,
            store_only = stats.store_only,
            "scan ended"
        );

        // Free the slot before anyone waiting on the handle wakes up.
        drop(guard);
        self.status_tx.send_replace(terminal);
    }

    async fn drive(&mut self) -> Result<ScanStatus, ScanError> {
        self.advance(ScanStatus::Starting).await?;

        for runner in std::mem::take(&mut self.runners) {
            self.bus.register(runner);
        }
        if self.bus.stop_requested() {
            self.advance(ScanStatus::Aborting).await?;
            return Ok(ScanStatus::Aborted);
        }

        self.bus.publish_root().await?;
        for seed in self.seed_events() {
            self.bus.publish(seed).await?;
        }

        self.advance(ScanStatus::Running).await?;

        for index in 0..self.bus.runners().len() {
            if self.bus.stop_requested() {
                break;
            }
            self.bus.start_module(index).await?;
        }

        Ok(if self.bus.stop_requested() {
            ScanStatus::Aborted
        } else {
            ScanStatus::Finished
        })
    }

    /// The typed seed event, plus a `DOMAIN_NAME` twin for a bare domain.
    fn seed_events(&self) -> Vec<ScanEvent> {
        let root = self.bus.root();
        let mut seeds = vec![ScanEvent::new(
            self.target.kind().event_type(),
            self.target.value(),
            CONTROLLER,
            root,
        )];
        if self.target.is_registrable_domain() {
            seeds.push(ScanEvent::new(
                EventType::DOMAIN_NAME,
                self.target.value(),
                CONTROLLER,
                root,
            ));
        }
        seeds
    }

    /// Move to a non-terminal status and announce it.
    async fn advance(&mut self, next: ScanStatus) -> Result<(), ScanError> {
        self.persist(next).await?;
        self.status_tx.send_replace(next);
        Ok(())
    }

    async fn persist(&mut self, next: ScanStatus) -> Result<(), ScanError> {
        if !self.status.can_transition_to(next) {
            return Err(ScanError::IllegalTransition {
                from: self.status,
                to: next,
            });
        }
        let now = Utc::now();
        let started = (next == ScanStatus::Starting).then_some(now);
        let ended = next.is_terminal().then_some(now);
        self.store
            .set_scan_status(self.scan_id, started, ended, next)
            .await?;
        debug!(scan_id = %self.scan_id, from = %self.status, to = %next, "scan status changed");
        self.status = next;
        Ok(())
    }
}
