//! End-to-end: registry change → watcher tree → controller → publisher.

mod common;

use std::io::Write;
use std::sync::Arc;

use common::{eventually, main_conf, write, writer, MockFactory, CLUSTER, PLATFORM, SYSTEM};
use conf_runtime::conf::ServerType;
use conf_runtime::config::RuntimeConfig;
use conf_runtime::lifecycle::HookRegistry;
use conf_runtime::publish::DiscoveryMetadata;
use conf_runtime::registry::{MemoryRegistry, Registry};
use conf_runtime::{Runtime, ServerState};

const API_MAIN: &str = "/hydra/order/prod/conf/api/main";
const API_ROUTER: &str = "/hydra/order/prod/conf/api/router";
const API_DISCOVERY: &str = "/hydra/order/prod/api/node-1";

fn config() -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.cluster.platform = PLATFORM.into();
    config.cluster.system = SYSTEM.into();
    config.cluster.name = CLUSTER.into();
    config.cluster.instance_name = Some("node-1".into());
    config.servers.types = vec![ServerType::Api, ServerType::Web];
    config.watch.debounce_ms = 20;
    config.lifecycle.drain_timeout_secs = 1;
    config
}

fn hooks() -> Arc<HookRegistry> {
    Arc::new(HookRegistry::new())
}

async fn discovery(registry: &MemoryRegistry, path: &str) -> Option<DiscoveryMetadata> {
    let (data, _) = registry.get(path).await.ok()?;
    serde_json::from_slice(&data).ok()
}

#[tokio::test]
async fn test_runtime_follows_registry() {
    let registry = Arc::new(MemoryRegistry::new());
    write(registry.as_ref(), API_MAIN, &main_conf(":8080")).await;
    let factory = MockFactory::new();

    let runtime = Runtime::with_registry(&config(), registry.clone(), factory.clone(), hooks()).await.unwrap();
    let api = runtime.controller(ServerType::Api).unwrap();
    let web = runtime.controller(ServerType::Web).unwrap();

    assert!(eventually(|| async { api.state() == ServerState::Running }).await);
    assert_eq!(discovery(&registry, API_DISCOVERY).await.unwrap().cluster_id, CLUSTER);
    // No main config for web yet: it stays stopped.
    assert_eq!(web.state(), ServerState::Stopped);

    let admin = writer(&registry);
    write(&admin, API_MAIN, &main_conf(":9090")).await;
    assert!(eventually(|| async { api.address().as_deref() == Some(":9090") }).await);
    assert!(eventually(|| async {
        discovery(&registry, API_DISCOVERY).await.map(|m| m.service) == Some("http://127.0.0.1:9090".into())
    })
    .await);

    write(&admin, API_ROUTER, br#"{"routers":[]}"#).await;
    assert!(eventually(|| async { factory.starts() == 3 }).await);

    write(&admin, "/hydra/order/prod/conf/web/main", &main_conf(":8081")).await;
    assert!(eventually(|| async { web.state() == ServerState::Running }).await);

    runtime.shutdown().await.unwrap();
    assert_eq!(api.state(), ServerState::Stopped);
    assert_eq!(web.state(), ServerState::Stopped);
    assert!(!admin.exists(API_DISCOVERY).await.unwrap());
    assert!(!admin.exists("/hydra/order/prod/web/node-1").await.unwrap());
}

#[tokio::test]
async fn test_runtime_republishes_after_session_loss() {
    let registry = Arc::new(MemoryRegistry::new());
    write(registry.as_ref(), API_MAIN, &main_conf(":8080")).await;
    let mut config = config();
    config.servers.types = vec![ServerType::Api];

    let runtime = Runtime::with_registry(&config, registry.clone(), MockFactory::new(), hooks()).await.unwrap();
    let api = runtime.controller(ServerType::Api).unwrap();
    assert!(eventually(|| async { api.state() == ServerState::Running }).await);

    registry.disconnect();
    assert!(!registry.store().contains(API_DISCOVERY));
    registry.reconnect();

    assert!(eventually(|| async { registry.store().contains(API_DISCOVERY) }).await);
    assert_eq!(api.state(), ServerState::Running);
    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_runtime_seeds_missing_nodes() {
    let mut seed = tempfile::NamedTempFile::new().unwrap();
    write!(seed, r#"{{"api":{{"main":{{"address":":7070"}},"router":{{"routers":[]}}}}}}"#).unwrap();

    let mut config = config();
    config.servers.types = vec![ServerType::Api];
    config.seed = Some(seed.path().to_path_buf());

    let registry = Arc::new(MemoryRegistry::new());
    let runtime = Runtime::with_registry(&config, registry.clone(), MockFactory::new(), hooks()).await.unwrap();
    let api = runtime.controller(ServerType::Api).unwrap();

    assert!(eventually(|| async { api.address().as_deref() == Some(":7070") }).await);
    assert!(api.committed().await.unwrap().sub("router").is_some());
    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_fail_stopped_instance_restarts_on_resync() {
    let registry = Arc::new(MemoryRegistry::new());
    write(registry.as_ref(), API_MAIN, &main_conf(":8080")).await;
    let factory = MockFactory::new();
    let mut config = config();
    config.servers.types = vec![ServerType::Api];

    let runtime = Runtime::with_registry(&config, registry.clone(), factory.clone(), hooks()).await.unwrap();
    let api = runtime.controller(ServerType::Api).unwrap();
    assert!(eventually(|| async { api.state() == ServerState::Running }).await);

    factory.fail_on(":9999");
    let admin = writer(&registry);
    write(&admin, API_MAIN, &main_conf(":9999")).await;
    assert!(eventually(|| async { factory.starts() == 1 && api.state() == ServerState::Stopped }).await);

    // Same bytes again: the watcher has nothing new to report.
    factory.heal(":9999");
    write(&admin, API_MAIN, &main_conf(":9999")).await;
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert_eq!(api.state(), ServerState::Stopped);

    // A resync re-delivers the current state and the driver starts it.
    registry.disconnect();
    registry.reconnect();
    assert!(eventually(|| async { api.address().as_deref() == Some(":9999") }).await);
    assert_eq!(api.state(), ServerState::Running);
    assert!(eventually(|| async { registry.store().contains(API_DISCOVERY) }).await);
    runtime.shutdown().await.unwrap();
}
