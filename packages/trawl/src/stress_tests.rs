//! Stress tests designed to break the bus and the controller.
//!
//! These tests exercise deep provenance chains, wide fan-out, stop races and
//! repeated scans on one controller.

#[cfg(test)]
mod stress_tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::bus::{EventBus, ModuleRunner};
    use crate::controller::{ScanController, ScanRequest, ScanSlot};
    use crate::event::{EventType, ScanEvent};
    use crate::module::SharedServices;
    use crate::registry::ModuleRegistry;
    use crate::scan::{ScanId, ScanInstance, ScanStatus};
    use crate::store::{provenance_chain, MemoryStore, ScanStore};
    use crate::target::Target;
    use crate::testing::{Journal, ScriptedModule};
    use crate::TrawlConfig;

    async fn bus_with(modules: Vec<ScriptedModule>) -> (EventBus, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let scan_id = ScanId::new();
        store
            .create_scan_instance(&ScanInstance::new(scan_id, "stress", "example.com"))
            .await
            .unwrap();
        let target = Target::parse("example.com").unwrap();
        let root = Arc::new(ScanEvent::root(target.value()));
        let mut bus = EventBus::new(
            scan_id,
            store.clone(),
            Arc::new(SharedServices::default()),
            Arc::new(target),
            root,
        );
        for module in modules {
            bus.register(ModuleRunner::new(Box::new(module)));
        }
        (bus, store)
    }

    // ==========================================================================
    // Depth
    // ==========================================================================

    /// A module that feeds on its own output for thousands of generations.
    /// Recursive delivery would blow the stack long before this finishes.
    #[tokio::test]
    async fn test_deep_self_feeding_chain() {
        const DEPTH: usize = 3_000;

        let (mut bus, store) = bus_with(vec![ScriptedModule::new("sfp_crawl")
            .consumes([EventType::LINKED_URL_INTERNAL])
            .emits_on(EventType::LINKED_URL_INTERNAL, |e| {
                let n = page_number(e.data());
                if n + 1 >= DEPTH {
                    Vec::new()
                } else {
                    vec![(
                        EventType::LINKED_URL_INTERNAL,
                        format!("https://example.com/page/{}", n + 1),
                    )]
                }
            })])
        .await;

        bus.publish_root().await.unwrap();
        let first = ScanEvent::new(
            EventType::LINKED_URL_INTERNAL,
            "https://example.com/page/0",
            "test",
            bus.root(),
        );
        bus.publish(first).await.unwrap();

        let events = store.scan_events(bus.scan_id()).await.unwrap();
        assert_eq!(events.len(), DEPTH + 1);
        assert_eq!(bus.stats().deliveries, DEPTH);

        let deepest = events.last().unwrap();
        let chain = provenance_chain(store.as_ref(), bus.scan_id(), &deepest.hash)
            .await
            .unwrap();
        // DEPTH - 1 crawled ancestors, then ROOT.
        assert_eq!(chain.len(), DEPTH);
        assert!(chain.last().unwrap().is_root());
    }

    // ==========================================================================
    // Width
    // ==========================================================================

    #[tokio::test]
    async fn test_wide_fan_out_keeps_publish_order() {
        const WIDTH: usize = 1_000;

        let journal = Journal::new();
        let (mut bus, store) = bus_with(vec![
            ScriptedModule::new("sfp_portscan")
                .consumes([EventType::IP_ADDRESS])
                .emits_on(EventType::IP_ADDRESS, |_| {
                    (0..WIDTH)
                        .map(|port| (EventType::TCP_PORT_OPEN, format!("10.0.0.1:{port}")))
                        .collect()
                }),
            ScriptedModule::new("sfp_banner")
                .consumes([EventType::TCP_PORT_OPEN])
                .journal(journal.clone()),
        ])
        .await;

        let ip = ScanEvent::new(EventType::IP_ADDRESS, "10.0.0.1", "test", bus.root());
        bus.publish(ip).await.unwrap();

        let seen = journal.entries();
        assert_eq!(seen.len(), WIDTH);
        for (port, entry) in seen.iter().enumerate() {
            assert_eq!(entry, &format!("sfp_banner <- TCP_PORT_OPEN 10.0.0.1:{port}"));
        }
        assert_eq!(store.scan_events(bus.scan_id()).await.unwrap().len(), WIDTH + 1);
    }

    #[tokio::test]
    async fn test_many_listeners_each_called_once() {
        let journal = Journal::new();
        let modules = (0..50)
            .map(|i| {
                ScriptedModule::new(format!("sfp_{i:02}"))
                    .consumes([EventType::EMAILADDR])
                    .journal(journal.clone())
            })
            .collect();
        let (mut bus, _store) = bus_with(modules).await;

        let email = ScanEvent::new(EventType::EMAILADDR, "jane@example.com", "test", bus.root());
        bus.publish(email).await.unwrap();

        let seen = journal.entries();
        assert_eq!(seen.len(), 50);
        let mut sorted = seen.clone();
        sorted.sort();
        assert_eq!(seen, sorted);
    }

    // ==========================================================================
    // Stop Races
    // ==========================================================================

    fn page_number(url: &str) -> usize {
        url.rsplit('/').next().and_then(|n| n.parse().ok()).unwrap_or(0)
    }

    #[tokio::test]
    async fn test_stop_during_endless_chain() {
        let journal = Journal::new();
        let registry = ModuleRegistry::new().with_module("sfp_crawl", {
            let journal = journal.clone();
            move || {
                ScriptedModule::new("sfp_crawl")
                    .consumes([EventType::INTERNET_NAME, EventType::LINKED_URL_INTERNAL])
                    .emits_on(EventType::INTERNET_NAME, |e| {
                        vec![(EventType::LINKED_URL_INTERNAL, format!("https://{}/0", e.data()))]
                    })
                    .emits_on(EventType::LINKED_URL_INTERNAL, |e| {
                        let next = page_number(e.data()) + 1;
                        vec![(
                            EventType::LINKED_URL_INTERNAL,
                            format!("https://example.com/{next}"),
                        )]
                    })
                    .sleeps_on_event(Duration::from_millis(1))
                    .journal(journal.clone())
            }
        });
        let controller = Arc::new(
            ScanController::new(registry, Arc::new(MemoryStore::new()), TrawlConfig::default())
                .with_slot(ScanSlot::new()),
        );

        let mut handle = controller
            .start_scan(ScanRequest::new("endless", "example.com"))
            .await
            .unwrap();
        let scan_id = handle.id();
        let stopper = tokio::spawn({
            let controller = Arc::clone(&controller);
            let journal = journal.clone();
            async move {
                while journal.len() < 20 {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                controller.stop_scan(scan_id)
            }
        });

        let terminal = tokio::time::timeout(Duration::from_secs(10), handle.wait())
            .await
            .expect("stop did not end the chain");
        assert_eq!(terminal, ScanStatus::Aborted);
        stopper.await.unwrap().unwrap();
        assert!(journal.len() >= 20);
        assert!(controller.stop_scan(scan_id).is_err());
    }

    #[tokio::test]
    async fn test_stop_races_with_start() {
        for _ in 0..20 {
            let registry = ModuleRegistry::new()
                .with_module("sfp_a", || ScriptedModule::new("sfp_a").consumes_all())
                .with_module("sfp_b", || ScriptedModule::new("sfp_b"));
            let controller =
                ScanController::new(registry, Arc::new(MemoryStore::new()), TrawlConfig::default())
                    .with_slot(ScanSlot::new());

            let mut handle = controller
                .start_scan(ScanRequest::new("race", "example.com"))
                .await
                .unwrap();
            // The task may be anywhere between STARTING and done.
            let _ = controller.stop_scan(handle.id());

            let terminal = handle.wait().await;
            assert!(
                matches!(terminal, ScanStatus::Aborted | ScanStatus::Finished),
                "unexpected terminal status {terminal}"
            );
            assert_eq!(controller.active_scan(), None);
        }
    }

    // ==========================================================================
    // Reuse
    // ==========================================================================

    #[tokio::test]
    async fn test_sequential_scans_on_one_controller() {
        let registry = ModuleRegistry::new().with_module("sfp_names", || {
            ScriptedModule::new("sfp_names")
                .consumes([EventType::INTERNET_NAME])
                .emits_on(EventType::INTERNET_NAME, |e| {
                    vec![(EventType::IP_ADDRESS, format!("ip-of-{}", e.data()))]
                })
        });
        let store = Arc::new(MemoryStore::new());
        let controller = ScanController::new(registry, store.clone(), TrawlConfig::default())
            .with_slot(ScanSlot::new());

        let mut ids = Vec::new();
        for i in 0..25 {
            let mut handle = controller
                .start_scan(ScanRequest::new(format!("scan {i}"), format!("host{i}.example.com")))
                .await
                .unwrap();
            assert_eq!(handle.wait().await, ScanStatus::Finished);
            ids.push(handle.id());
        }

        for (i, id) in ids.iter().enumerate() {
            let events = store.scan_events(*id).await.unwrap();
            assert_eq!(events.len(), 3, "scan {i}");
            assert_eq!(events[2].data, format!("ip-of-host{i}.example.com"));
        }
        assert_eq!(store.scan_instances().len(), 25);
    }

    #[tokio::test]
    async fn test_panicking_module_does_not_hang_or_hold_slot() {
        let registry = ModuleRegistry::new().with_module("sfp_boom", || {
            ScriptedModule::new("sfp_boom")
                .consumes([EventType::INTERNET_NAME])
                .panics_on(EventType::INTERNET_NAME)
        });
        let controller =
            ScanController::new(registry, Arc::new(MemoryStore::new()), TrawlConfig::default())
                .with_slot(ScanSlot::new());

        for _ in 0..3 {
            let mut handle = controller
                .start_scan(ScanRequest::new("boom", "www.example.com"))
                .await
                .unwrap();
            let terminal = tokio::time::timeout(Duration::from_secs(5), handle.wait())
                .await
                .expect("scan did not end");
            assert_eq!(terminal, ScanStatus::ErrorFailed);
        }
    }
}
