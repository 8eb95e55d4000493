//! Controller transitions against the in-memory registry.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{eventually, paths, snapshot, FaultyRegistry, ListenerEvent, MockFactory};
use conf_runtime::conf::{ConfSnapshot, ServerConf, ServerType};
use conf_runtime::lifecycle::{
    ControllerError, ControllerOptions, HookError, HookRegistry, LaunchError, LifecycleHook, NotifyOutcome,
    ResponsiveController, ServerState,
};
use conf_runtime::publish::DiscoveryMetadata;
use conf_runtime::registry::{MemoryRegistry, Registry};
use conf_runtime::resilience::BackoffPolicy;
use parking_lot::Mutex;

const INSTANCE: &str = "svc1";
const DISCOVERY_DIR: &str = "/hydra/order/prod/api";
const DISCOVERY_PATH: &str = "/hydra/order/prod/api/svc1";

fn setup_with(options: ControllerOptions) -> (Arc<MemoryRegistry>, Arc<MockFactory>, Arc<ResponsiveController>) {
    let registry = Arc::new(MemoryRegistry::new());
    let factory = MockFactory::new();
    let controller = Arc::new(ResponsiveController::new(
        registry.clone(),
        paths(ServerType::Api),
        factory.clone(),
        options,
    ));
    (registry, factory, controller)
}

fn setup() -> (Arc<MemoryRegistry>, Arc<MockFactory>, Arc<ResponsiveController>) {
    let mut options = ControllerOptions::new(INSTANCE, "c1");
    options.drain_timeout = Duration::from_millis(100);
    setup_with(options)
}

async fn published(registry: &MemoryRegistry) -> Option<DiscoveryMetadata> {
    match registry.get(DISCOVERY_PATH).await {
        Ok((data, _)) => Some(serde_json::from_slice(&data).unwrap()),
        Err(_) => None,
    }
}

#[tokio::test]
async fn test_start_publishes() {
    let (registry, factory, controller) = setup();
    controller.start(snapshot(":8080")).await.unwrap();

    assert_eq!(controller.state(), ServerState::Running);
    assert_eq!(controller.address().as_deref(), Some(":8080"));
    assert_eq!(factory.events(), vec![ListenerEvent::Started(":8080".into())]);

    let metadata = published(&registry).await.unwrap();
    assert_eq!(metadata.service, "http://127.0.0.1:8080");
    assert_eq!(metadata.cluster_id, "c1");
}

#[tokio::test]
async fn test_start_failure_publishes_nothing() {
    let (registry, factory, controller) = setup();
    factory.fail_on(":8080");

    let err = controller.start(snapshot(":8080")).await.unwrap_err();
    assert!(matches!(err, ControllerError::StartFailure(_)));
    assert_eq!(controller.state(), ServerState::Stopped);
    assert!(published(&registry).await.is_none());
    assert!(controller.committed().await.is_none());
}

#[tokio::test]
async fn test_start_rejects_missing_main() {
    let (_registry, factory, controller) = setup();
    let err = controller.start(ConfSnapshot::default()).await.unwrap_err();
    assert!(matches!(err, ControllerError::Conf(_)));
    assert_eq!(controller.state(), ServerState::Stopped);
    assert_eq!(factory.starts(), 0);
}

#[tokio::test]
async fn test_unchanged_notify_leaves_listener_alone() {
    let (_registry, factory, controller) = setup();
    controller.start(snapshot(":8080")).await.unwrap();

    let cosmetic = ConfSnapshot::new(br#"{"address":":8080","status":"start","rTimeout":30}"#.to_vec());
    let outcome = controller.notify(cosmetic).await.unwrap();

    assert_eq!(outcome, NotifyOutcome::Unchanged);
    assert_eq!(factory.starts(), 1);
    assert_eq!(factory.stops(), 0);
}

#[tokio::test]
async fn test_address_change_restarts_on_same_path() {
    let (registry, factory, controller) = setup();
    controller.start(snapshot(":8080")).await.unwrap();

    let outcome = controller.notify(snapshot(":9090")).await.unwrap();
    assert_eq!(outcome, NotifyOutcome::Restarted);
    assert_eq!(controller.state(), ServerState::Running);
    assert_eq!(controller.address().as_deref(), Some(":9090"));
    assert_eq!(
        factory.events(),
        vec![
            ListenerEvent::Started(":8080".into()),
            ListenerEvent::Stopped(":8080".into()),
            ListenerEvent::Started(":9090".into()),
        ]
    );

    assert_eq!(registry.children(DISCOVERY_DIR).await.unwrap(), vec![INSTANCE.to_string()]);
    assert_eq!(published(&registry).await.unwrap().service, "http://127.0.0.1:9090");
}

#[tokio::test]
async fn test_router_change_restarts() {
    let (_registry, factory, controller) = setup();
    let base = snapshot(":8080").with_sub("router", r#"{"routers":[]}"#);
    controller.start(base).await.unwrap();

    let changed = snapshot(":8080").with_sub("router", r#"{"routers":[{"path":"/a","service":"a"}]}"#);
    let outcome = controller.notify(changed.clone()).await.unwrap();
    assert_eq!(outcome, NotifyOutcome::Restarted);
    assert_eq!(factory.starts(), 2);

    let committed = controller.committed().await.unwrap();
    assert_eq!(committed.sub("router"), changed.subs.get("router").map(Vec::as_slice));
}

#[tokio::test]
async fn test_sub_conf_commit_without_restart_when_disabled() {
    let mut options = ControllerOptions::new(INSTANCE, "c1");
    options.restart_on_sub_conf = false;
    let (_registry, factory, controller) = setup_with(options);
    controller.start(snapshot(":8080")).await.unwrap();

    let outcome = controller.notify(snapshot(":8080").with_sub("header", "{}")).await.unwrap();
    assert_eq!(outcome, NotifyOutcome::Committed);
    assert_eq!(factory.stops(), 0);
    assert!(controller.committed().await.unwrap().sub("header").is_some());

    // A binding change still restarts.
    let outcome = controller.notify(snapshot(":9090").with_sub("header", "{}")).await.unwrap();
    assert_eq!(outcome, NotifyOutcome::Restarted);
}

#[tokio::test]
async fn test_malformed_config_keeps_running() {
    let (registry, factory, controller) = setup();
    controller.start(snapshot(":8080")).await.unwrap();

    let err = controller.notify(ConfSnapshot::new(b"{broken".to_vec())).await.unwrap_err();
    assert!(matches!(err, ControllerError::Conf(_)));
    let err = controller.notify(snapshot(":8080").with_sub("router", "not json")).await.unwrap_err();
    assert!(matches!(err, ControllerError::Conf(_)));

    assert_eq!(controller.state(), ServerState::Running);
    assert_eq!(factory.stops(), 0);
    assert!(published(&registry).await.is_some());

    // The baseline is still :8080, so the same config is a no-op.
    assert_eq!(controller.notify(snapshot(":8080")).await.unwrap(), NotifyOutcome::Unchanged);
}

#[tokio::test]
async fn test_restart_failure_is_fail_stop() {
    let (registry, factory, controller) = setup();
    controller.start(snapshot(":8080")).await.unwrap();
    factory.fail_on(":9999");

    let err = controller.notify(snapshot(":9999")).await.unwrap_err();
    assert!(matches!(err, ControllerError::RestartFailure(_)));
    assert_eq!(controller.state(), ServerState::Stopped);
    assert!(controller.address().is_none());
    assert!(!registry.children(DISCOVERY_DIR).await.unwrap().contains(&INSTANCE.to_string()));

    let err = controller.notify(snapshot(":8080")).await.unwrap_err();
    assert!(matches!(err, ControllerError::NotRunning));

    // A fresh start recovers.
    controller.start(snapshot(":8080")).await.unwrap();
    assert!(published(&registry).await.is_some());
}

#[tokio::test]
async fn test_shutdown_unpublishes_then_stops() {
    let (registry, factory, controller) = setup();
    controller.start(snapshot(":8080")).await.unwrap();
    let mut states = controller.subscribe_state();

    controller.shutdown().await.unwrap();
    assert_eq!(controller.state(), ServerState::Stopped);
    assert!(states.has_changed().unwrap());
    assert_eq!(*states.borrow_and_update(), ServerState::Stopped);
    assert!(published(&registry).await.is_none());
    assert_eq!(factory.stops(), 1);

    // Idempotent.
    controller.shutdown().await.unwrap();
    assert_eq!(factory.stops(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_notifies_coalesce() {
    let (_registry, factory, controller) = setup();
    controller.start(snapshot(":8080")).await.unwrap();

    let gate = factory.gate();
    gate.close();
    let first = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.notify(snapshot(":9090")).await })
    };
    gate.entered().await;

    let mut waiting = Vec::new();
    for port in 9091..=9095 {
        let controller = controller.clone();
        waiting.push(tokio::spawn(async move { controller.notify(snapshot(&format!(":{}", port))).await }));
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(controller.state(), ServerState::Restarting);
    gate.open();

    assert_eq!(first.await.unwrap().unwrap(), NotifyOutcome::Restarted);
    let mut outcomes = Vec::new();
    for task in waiting {
        outcomes.push(task.await.unwrap().unwrap());
    }
    // Only the caller holding the newest configuration sees it applied.
    assert_eq!(
        outcomes,
        vec![
            NotifyOutcome::Superseded,
            NotifyOutcome::Superseded,
            NotifyOutcome::Superseded,
            NotifyOutcome::Superseded,
            NotifyOutcome::Restarted,
        ]
    );

    assert_eq!(controller.address().as_deref(), Some(":9095"));
    assert_eq!(factory.starts(), 3);
}

fn faulty_setup() -> (Arc<MemoryRegistry>, Arc<FaultyRegistry>, Arc<MockFactory>, ResponsiveController) {
    let registry = Arc::new(MemoryRegistry::new());
    let faulty = FaultyRegistry::new(registry.clone());
    let factory = MockFactory::new();
    let mut options = ControllerOptions::new(INSTANCE, "c1");
    options.drain_timeout = Duration::from_millis(100);
    options.publish_backoff = BackoffPolicy::new(10, 50);
    let controller = ResponsiveController::new(faulty.clone(), paths(ServerType::Api), factory.clone(), options);
    (registry, faulty, factory, controller)
}

#[tokio::test]
async fn test_fail_stop_retries_refused_unpublish() {
    let (registry, faulty, factory, controller) = faulty_setup();
    controller.start(snapshot(":8080")).await.unwrap();
    assert!(registry.store().contains(DISCOVERY_PATH));

    faulty.fail_deletes(1);
    factory.fail_on(":9999");
    let err = controller.notify(snapshot(":9999")).await.unwrap_err();
    assert!(matches!(err, ControllerError::RestartFailure(_)));
    assert_eq!(controller.state(), ServerState::Stopped);
    assert!(controller.publisher().published_path().is_none());

    assert!(eventually(|| async { !registry.store().contains(DISCOVERY_PATH) }).await);
    assert!(controller.publisher().pending_removal().is_none());
}

#[tokio::test]
async fn test_shutdown_retries_refused_unpublish() {
    let (registry, faulty, factory, controller) = faulty_setup();
    controller.start(snapshot(":8080")).await.unwrap();

    faulty.fail_deletes(2);
    controller.shutdown().await.unwrap();
    assert_eq!(controller.state(), ServerState::Stopped);
    assert_eq!(factory.stops(), 1);

    assert!(eventually(|| async { !registry.store().contains(DISCOVERY_PATH) }).await);
    assert!(controller.publisher().pending_removal().is_none());
}

#[tokio::test]
async fn test_successful_restart_after_refused_unpublish_stays_published() {
    let (registry, faulty, _factory, controller) = faulty_setup();
    controller.start(snapshot(":8080")).await.unwrap();

    faulty.fail_deletes(1);
    assert_eq!(controller.notify(snapshot(":9090")).await.unwrap(), NotifyOutcome::Restarted);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(controller.publisher().pending_removal().is_none());
    assert_eq!(published(&registry).await.unwrap().service, "http://127.0.0.1:9090");
}

/// Records hook calls alongside how many listeners had stopped at the time.
struct Recorder {
    factory: Arc<MockFactory>,
    refuse_address: Option<String>,
    calls: Mutex<Vec<(String, usize)>>,
}

impl Recorder {
    fn new(factory: Arc<MockFactory>, refuse_address: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            factory,
            refuse_address: refuse_address.map(str::to_string),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<(String, usize)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl LifecycleHook for Recorder {
    async fn starting(&self, conf: &ServerConf) -> Result<(), HookError> {
        let address = conf.binding().address.clone();
        self.calls.lock().push((format!("starting {}", address), self.factory.stops()));
        if self.refuse_address.as_deref() == Some(address.as_str()) {
            return Err(HookError::new("dependency unavailable"));
        }
        Ok(())
    }

    async fn closing(&self, conf: &ServerConf) -> Result<(), HookError> {
        self.calls.lock().push((format!("closing {}", conf.binding().address), self.factory.stops()));
        Ok(())
    }
}

fn hooked_setup(refuse: Option<&str>) -> (Arc<MemoryRegistry>, Arc<MockFactory>, Arc<Recorder>, ResponsiveController) {
    let registry = Arc::new(MemoryRegistry::new());
    let factory = MockFactory::new();
    let recorder = Recorder::new(factory.clone(), refuse);
    let hooks = Arc::new(HookRegistry::new());
    hooks.register("recorder", recorder.clone());

    let mut options = ControllerOptions::new(INSTANCE, "c1");
    options.drain_timeout = Duration::from_millis(100);
    options.hooks = hooks;
    let controller = ResponsiveController::new(registry.clone(), paths(ServerType::Api), factory.clone(), options);
    (registry, factory, recorder, controller)
}

#[tokio::test]
async fn test_hooks_wrap_start_restart_and_shutdown() {
    let (_registry, _factory, recorder, controller) = hooked_setup(None);
    controller.start(snapshot(":8080")).await.unwrap();
    controller.notify(snapshot(":9090")).await.unwrap();
    controller.shutdown().await.unwrap();

    assert_eq!(
        recorder.calls(),
        vec![
            ("starting :8080".to_string(), 0),
            ("closing :8080".to_string(), 1),
            ("starting :9090".to_string(), 1),
            ("closing :9090".to_string(), 2),
        ]
    );
}

#[tokio::test]
async fn test_starting_hook_vetoes_start() {
    let (registry, factory, _recorder, controller) = hooked_setup(Some(":8080"));
    let err = controller.start(snapshot(":8080")).await.unwrap_err();

    assert!(matches!(err, ControllerError::StartFailure(LaunchError::Vetoed(_))));
    assert_eq!(controller.state(), ServerState::Stopped);
    assert_eq!(factory.starts(), 0);
    assert!(published(&registry).await.is_none());
}

#[tokio::test]
async fn test_starting_hook_veto_on_restart_is_fail_stop() {
    let (registry, factory, _recorder, controller) = hooked_setup(Some(":9999"));
    controller.start(snapshot(":8080")).await.unwrap();

    let err = controller.notify(snapshot(":9999")).await.unwrap_err();
    assert!(matches!(err, ControllerError::RestartFailure(LaunchError::Vetoed(_))));
    assert_eq!(controller.state(), ServerState::Stopped);
    assert_eq!(factory.starts(), 1);
    assert!(published(&registry).await.is_none());
}
