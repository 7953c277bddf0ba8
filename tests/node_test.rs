use async_trait::async_trait;
use parking_lot::Mutex;
use service_hive::config::{NodeConfig, ParentShutdownPolicy, PortRange, Role};
use service_hive::error::Error;
use service_hive::link::{Uplink, UplinkConfig};
use service_hive::protocol::{
    self, Action, ControlHandler, ControlServer, Mode, Request, Response, Target, CORE_SHUTDOWN,
};
use service_hive::service::{Status, SupervisorPolicy};
use service_hive::{start_node, RunningNode};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const CALL_TIMEOUT: Duration = Duration::from_secs(3);

fn fast(mut config: NodeConfig) -> NodeConfig {
    config.heartbeat_interval = Duration::from_millis(100);
    config.registration_retry = Duration::from_millis(100);
    config.reconnect_delay = Duration::from_millis(100);
    config.call_timeout = CALL_TIMEOUT;
    config.shutdown_notice_timeout = Duration::from_millis(500);
    config.supervisor = SupervisorPolicy {
        backoff: Duration::from_millis(50),
        grace_period: Duration::from_secs(1),
        ..SupervisorPolicy::default()
    };
    config
}

fn hub(role: Role, name: &str, low: u16) -> NodeConfig {
    let mut config = fast(NodeConfig::new(role, name));
    config.listen = Some("127.0.0.1:0".to_string());
    config.ports = PortRange {
        host: "127.0.0.1".to_string(),
        low,
        high: low + 100,
    };
    config
}

fn agent_config(name: &str, parent: &RunningNode, manifests: Option<&Path>) -> NodeConfig {
    let mut config = fast(NodeConfig::new(Role::Remote, name));
    config.parent = parent.local_addr().map(|a| a.to_string());
    config.manifest_dir = manifests.map(Path::to_path_buf);
    config
}

fn write_manifest(dir: &Path, name: &str, script: &str) {
    let yaml = format!(
        "name: {}\nbinary: /bin/sh\nargs: [\"-c\", \"{}\"]\n",
        name, script
    );
    fs::write(dir.join(format!("{}.yaml", name)), yaml).expect("write manifest");
}

async fn call(node: &RunningNode, request: Request) -> Response {
    let addr = node.local_addr().expect("node listens").to_string();
    protocol::call(&addr, &request, CALL_TIMEOUT)
        .await
        .expect("control call")
}

async fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    check()
}

#[tokio::test]
async fn test_procm_forwards_to_agent_and_shuts_it_down() {
    let manifests = TempDir::new().unwrap();
    write_manifest(manifests.path(), "web", "sleep 30");

    let procm = start_node(hub(Role::Procm, "pm", 42000)).await.unwrap();
    let agent = start_node(agent_config("agent-a", &procm, Some(manifests.path())))
        .await
        .unwrap();

    let registration = tokio::time::timeout(
        Duration::from_secs(5),
        agent.uplink().unwrap().registration().wait_for_update(),
    )
    .await
    .expect("agent registers");
    assert_eq!(registration.id, 1);
    assert_eq!(registration.address, "127.0.0.1:42000");

    let children = procm.children().unwrap().clone();
    assert!(
        wait_until(Duration::from_secs(3), || {
            children
                .lookup_service("agent-a")
                .map(|r| r.heartbeats >= 2)
                .unwrap_or(false)
        })
        .await,
        "no heartbeats arrived"
    );

    // Fan-out summary prefixes the agent's ids with its registry id
    let services = match call(&procm, Request::Summary { target: Target::All }).await {
        Response::Summary { services } => services,
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].id, "1-1");
    assert_eq!(services[0].name, "web");
    let first_pid = services[0].pid;
    assert!(first_pid > 0);

    let restarted = call(
        &procm,
        Request::NotifyAction {
            action: Action::Restart,
            target: Target::One("1-1".into()),
        },
    )
    .await;
    match restarted {
        Response::Restarted { services } => {
            assert_eq!(services.len(), 1);
            assert_eq!(services[0].id, "1-1");
            assert!(services[0].error.is_none());
            assert!(services[0].pid > 0 && services[0].pid != first_pid);
        }
        other => panic!("unexpected {:?}", other),
    }

    // Unknown child
    let missing = protocol::call(
        &procm.local_addr().unwrap().to_string(),
        &Request::Summary {
            target: Target::One("9-1".into()),
        },
        CALL_TIMEOUT,
    )
    .await;
    assert!(missing.is_err());

    match call(&procm, Request::StopServer).await {
        Response::Message { text } => assert_eq!(text, "shutdown started"),
        other => panic!("unexpected {:?}", other),
    }
    tokio::time::timeout(Duration::from_secs(1), procm.stopped())
        .await
        .expect("procm stop requested");
    let outcome = procm.shutdown().await;
    assert_eq!(outcome.notices.delivered, vec!["agent-a".to_string()]);

    // Agents follow their parent down under the default policy
    tokio::time::timeout(Duration::from_secs(3), agent.stopped())
        .await
        .expect("agent told to stop");
    let ctx = agent.context().clone();
    agent.shutdown().await;
    assert!(ctx
        .services
        .snapshots()
        .iter()
        .all(|(_, snap)| snap.status == Status::Killed && snap.pid == -1));
}

#[tokio::test]
async fn test_agent_with_reconnect_policy_outlives_parent() {
    let core = start_node(hub(Role::Core, "core", 42200)).await.unwrap();
    let mut config = agent_config("agent-b", &core, None);
    config.on_parent_shutdown = ParentShutdownPolicy::Reconnect;
    let agent = start_node(config).await.unwrap();

    let handle = agent.uplink().unwrap().registration();
    tokio::time::timeout(Duration::from_secs(5), handle.wait_for_update())
        .await
        .expect("agent registers");

    let listed = match call(&core, Request::Summary { target: Target::All }).await {
        Response::Summary { services } => services,
        other => panic!("unexpected {:?}", other),
    };
    assert!(listed.iter().any(|s| s.name == "agent-b"));

    let outcome = core.shutdown().await;
    assert_eq!(outcome.notices.delivered, vec!["agent-b".to_string()]);

    // The agent drops its registration and keeps trying instead of exiting
    assert!(wait_until(Duration::from_secs(2), || handle.get().is_none()).await);
    assert!(
        tokio::time::timeout(Duration::from_millis(500), agent.stopped())
            .await
            .is_err()
    );

    let outcome = agent.shutdown().await;
    assert!(!outcome.parent_notified);
}

#[tokio::test]
async fn test_returning_agent_keeps_its_id() {
    let core = start_node(hub(Role::Core, "core", 42400)).await.unwrap();

    let first = start_node(agent_config("agent-c", &core, None)).await.unwrap();
    let registration = tokio::time::timeout(
        Duration::from_secs(5),
        first.uplink().unwrap().registration().wait_for_update(),
    )
    .await
    .expect("first registration");
    let outcome = first.shutdown().await;
    assert!(outcome.parent_notified);

    let children = core.children().unwrap().clone();
    assert!(!children.lookup_service("agent-c").unwrap().is_running());

    let second = start_node(agent_config("agent-c", &core, None)).await.unwrap();
    let again = tokio::time::timeout(
        Duration::from_secs(5),
        second.uplink().unwrap().registration().wait_for_update(),
    )
    .await
    .expect("second registration");
    assert_eq!(again.id, registration.id);
    assert_ne!(again.fingerprint, registration.fingerprint);
    assert_ne!(again.address, registration.address);

    second.shutdown().await;
    core.shutdown().await;
}

#[tokio::test]
async fn test_hub_without_listen_is_rejected() {
    let mut config = NodeConfig::new(Role::Core, "core");
    config.listen = None;
    assert!(start_node(config).await.is_err());
}

/// A parent that hands out `fp1`, `fp2`, ... on consecutive ports starting
/// at `base`, and remembers every heartbeat it receives.
struct ScriptedParent {
    base: u16,
    refuse: bool,
    registrations: AtomicUsize,
    heartbeats: Mutex<Vec<(String, Instant)>>,
}

impl ScriptedParent {
    fn new(base: u16) -> Arc<Self> {
        Self::build(base, false)
    }

    fn refusing() -> Arc<Self> {
        Self::build(0, true)
    }

    fn build(base: u16, refuse: bool) -> Arc<Self> {
        Arc::new(Self {
            base,
            refuse,
            registrations: AtomicUsize::new(0),
            heartbeats: Mutex::new(Vec::new()),
        })
    }

    fn heartbeats_from(&self, fingerprint: &str) -> Vec<Instant> {
        self.heartbeats
            .lock()
            .iter()
            .filter(|(fp, _)| fp == fingerprint)
            .map(|(_, at)| *at)
            .collect()
    }
}

#[async_trait]
impl ControlHandler for ScriptedParent {
    async fn handle(&self, request: Request, _peer: SocketAddr) -> service_hive::Result<Response> {
        match request {
            Request::Register { name, .. } => {
                let n = self.registrations.fetch_add(1, Ordering::SeqCst) + 1;
                if self.refuse {
                    return Err(Error::DuplicateName(name));
                }
                Ok(Response::Registered {
                    id: 1,
                    address: format!("127.0.0.1:{}", self.base + 2 * (n as u16 - 1)),
                    fingerprint: format!("fp{}", n),
                })
            }
            Request::Alive { fingerprint, .. } => {
                self.heartbeats.lock().push((fingerprint, Instant::now()));
                Ok(Response::Ack)
            }
            Request::NotifyShutdown { .. } | Request::Ping => Ok(Response::Ack),
            other => Err(Error::Protocol(format!("unexpected {}", other.kind()))),
        }
    }
}

/// Stands in for the node behind an uplink.
struct Quiet;

#[async_trait]
impl ControlHandler for Quiet {
    async fn handle(&self, request: Request, _peer: SocketAddr) -> service_hive::Result<Response> {
        match request {
            Request::Ping => Ok(Response::Pong),
            _ => Ok(Response::Ack),
        }
    }
}

fn uplink_config(name: &str, parent: &str, heartbeat: Duration) -> UplinkConfig {
    UplinkConfig {
        name: name.to_string(),
        aliases: Vec::new(),
        mode: Mode::Remote,
        parent: parent.to_string(),
        heartbeat_interval: heartbeat,
        registration_retry: Duration::from_millis(100),
        reconnect_delay: Duration::from_millis(100),
        call_timeout: Duration::from_millis(500),
        on_parent_shutdown: ParentShutdownPolicy::Reconnect,
    }
}

fn free_address() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().to_string()
}

#[tokio::test]
async fn test_notice_during_heartbeat_sleep_sends_no_stale_ping() {
    let parent = ScriptedParent::new(43000);
    let server = ControlServer::bind("127.0.0.1:0", parent.clone()).await.unwrap();
    let parent_addr = server.local_addr().to_string();

    let uplink = Uplink::start(
        uplink_config("agent-n", &parent_addr, Duration::from_millis(300)),
        Arc::new(Quiet),
        CancellationToken::new(),
    );
    let handle = uplink.registration();
    let first = tokio::time::timeout(Duration::from_secs(3), handle.wait_for_update())
        .await
        .expect("first registration");
    assert_eq!(first.fingerprint, "fp1");

    // Right after a heartbeat the loop is asleep until the next tick
    assert!(wait_until(Duration::from_secs(3), || !parent.heartbeats_from("fp1").is_empty()).await);
    let notice = Request::UpdateRegistration {
        reason: CORE_SHUTDOWN.to_string(),
    };
    assert_eq!(
        protocol::call(&first.address, &notice, CALL_TIMEOUT).await.unwrap(),
        Response::Ack
    );
    let acknowledged = Instant::now();

    let second = tokio::time::timeout(Duration::from_secs(3), handle.wait_for_change(&first))
        .await
        .expect("re-registration");
    assert_eq!(second.fingerprint, "fp2");
    assert_eq!(second.address, "127.0.0.1:43002");

    assert!(wait_until(Duration::from_secs(3), || parent.heartbeats_from("fp2").len() >= 2).await);
    let stale = parent
        .heartbeats_from("fp1")
        .into_iter()
        .filter(|at| *at > acknowledged)
        .count();
    assert_eq!(stale, 0);

    uplink.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn test_registration_waits_for_a_late_parent() {
    let parent_addr = free_address();
    let uplink = Uplink::start(
        uplink_config("agent-late", &parent_addr, Duration::from_millis(200)),
        Arc::new(Quiet),
        CancellationToken::new(),
    );

    // Several retry intervals pass with nobody listening
    tokio::time::sleep(Duration::from_millis(350)).await;
    assert!(uplink.registration().get().is_none());
    assert!(uplink.last_error().is_none());

    let parent = ScriptedParent::new(43100);
    let server = ControlServer::bind(&parent_addr, parent.clone()).await.unwrap();
    let registration = tokio::time::timeout(Duration::from_secs(3), uplink.registration().wait_for_update())
        .await
        .expect("registers once the parent is up");
    assert_eq!(registration.fingerprint, "fp1");
    assert_eq!(parent.registrations.load(Ordering::SeqCst), 1);

    uplink.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn test_refused_registration_is_not_retried() {
    let parent = ScriptedParent::refusing();
    let server = ControlServer::bind("127.0.0.1:0", parent.clone()).await.unwrap();
    let parent_addr = server.local_addr().to_string();

    let uplink = Uplink::start(
        uplink_config("agent-dup", &parent_addr, Duration::from_millis(200)),
        Arc::new(Quiet),
        CancellationToken::new(),
    );
    assert!(wait_until(Duration::from_secs(3), || uplink.last_error().is_some()).await);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(parent.registrations.load(Ordering::SeqCst), 1);
    assert!(uplink.registration().get().is_none());
    let reason = uplink.last_error().unwrap();
    assert!(reason.contains("duplicate_name"), "last error: {}", reason);

    uplink.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn test_unreachable_child_gets_a_placeholder_in_summary() {
    let procm = start_node(hub(Role::Procm, "pm", 43200)).await.unwrap();

    // Register a child that never starts serving on its address
    let registered = call(
        &procm,
        Request::Register {
            name: "ghost".into(),
            aliases: vec![],
            mode: Mode::Remote,
        },
    )
    .await;
    let address = match registered {
        Response::Registered { address, .. } => address,
        other => panic!("unexpected {:?}", other),
    };

    let services = match call(&procm, Request::Summary { target: Target::All }).await {
        Response::Summary { services } => services,
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].id, "1");
    assert_eq!(services[0].name, "ghost");
    assert_eq!(services[0].status, "unreachable");
    assert_eq!(services[0].pid, -1);
    assert!(services[0].errors[0].contains(&address), "{:?}", services[0].errors);

    procm.shutdown().await;
}
