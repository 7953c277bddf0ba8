use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::{NodeConfig, Parser, ServiceManifest};
use crate::error::{Error, Result};
use crate::protocol::{Action, Mode, Response, RestartOutcome, ServiceRecord, Target};
use crate::service::{ProcessSnapshot, Status, Supervisor, SupervisorPolicy};

/// Name of the node supervising a process.
pub const SUPERVISED_BY_ENV: &str = "HIVE_SUPERVISED_BY";
/// Control address a supervised process should register with.
pub const PARENT_ADDR_ENV: &str = "HIVE_PARENT_ADDR";

struct Entry {
    manifest: ServiceManifest,
    supervisor: Supervisor,
}

/// The processes one node supervises directly, keyed by a locally assigned
/// id. Ids come from a monotonic counter and are never reused.
pub struct ServiceSet {
    owner: String,
    parent_addr: Option<String>,
    policy: SupervisorPolicy,
    parser: Parser,
    next_id: AtomicU64,
    entries: Mutex<BTreeMap<u64, Entry>>,
}

impl ServiceSet {
    pub fn new(owner: impl Into<String>, parent_addr: Option<String>, policy: SupervisorPolicy) -> Self {
        Self {
            owner: owner.into(),
            parent_addr,
            policy,
            parser: Parser::new(),
            next_id: AtomicU64::new(1),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Supervised processes are pointed at `service_parent`, or at the
    /// node's own listener.
    pub fn from_config(config: &NodeConfig) -> Self {
        let parent_addr = config.service_parent.clone().or_else(|| config.listen.clone());
        Self::new(config.name.clone(), parent_addr, config.supervisor.clone())
    }

    /// Load a manifest file and start the service it describes.
    pub async fn add_service(&self, config_path: &Path) -> Result<u64> {
        let manifest = self.parser.load_manifest(config_path)?;
        let base_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
        self.add_manifest(manifest, base_dir).await
    }

    /// Start supervising `manifest`. The entry is kept even if the first
    /// launch fails, so its error stays visible in summaries.
    #[tracing::instrument(skip(self, manifest, base_dir), fields(service.name = %manifest.name))]
    pub async fn add_manifest(&self, manifest: ServiceManifest, base_dir: &Path) -> Result<u64> {
        manifest.validate()?;

        let mut launch = manifest.launch_spec(base_dir);
        launch.env.insert(SUPERVISED_BY_ENV.to_string(), self.owner.clone());
        if let Some(parent) = &self.parent_addr {
            launch.env.insert(PARENT_ADDR_ENV.to_string(), parent.clone());
        }

        let supervisor = Supervisor::new(manifest.name.clone(), launch, self.policy.clone());
        let id = {
            let mut entries = self.entries.lock();
            if entries.values().any(|e| e.manifest.name == manifest.name) {
                return Err(Error::DuplicateName(manifest.name.clone()));
            }
            check_aliases(&entries, &manifest)?;
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            entries.insert(
                id,
                Entry {
                    manifest,
                    supervisor: supervisor.clone(),
                },
            );
            id
        };

        supervisor.start().await?;
        tracing::info!("Service {} added as id {}", supervisor.name(), id);
        Ok(id)
    }

    pub fn lookup_service(&self, id: u64) -> Result<Supervisor> {
        self.entries
            .lock()
            .get(&id)
            .map(|e| e.supervisor.clone())
            .ok_or_else(|| Error::ServiceNotFound(id.to_string()))
    }

    /// Operator restart of one service. A service whose first launch failed
    /// is simply started.
    pub async fn restart(&self, id: u64) -> Result<i32> {
        let supervisor = self.lookup_service(id)?;
        if supervisor.status() == Status::Initialized {
            supervisor.start().await
        } else {
            supervisor.restart(false).await
        }
    }

    /// Restart every service concurrently, reporting each outcome.
    pub async fn restart_all(&self) -> Vec<RestartOutcome> {
        let ids: Vec<u64> = self.entries.lock().keys().copied().collect();
        let restarts = ids.into_iter().map(|id| async move {
            match self.restart(id).await {
                Ok(pid) => RestartOutcome {
                    id: id.to_string(),
                    pid,
                    error: None,
                },
                Err(e) => RestartOutcome {
                    id: id.to_string(),
                    pid: -1,
                    error: Some(e.to_string()),
                },
            }
        });
        join_all(restarts).await
    }

    /// Apply an operator or parent action to local services.
    pub async fn apply(&self, action: Action, target: &Target) -> Result<Response> {
        match (action, target) {
            (Action::Restart, Target::All) => Ok(Response::Restarted {
                services: self.restart_all().await,
            }),
            (Action::Restart, Target::One(raw)) => {
                let pid = self.restart(parse_local_id(raw)?).await?;
                Ok(Response::Restarted {
                    services: vec![RestartOutcome {
                        id: raw.clone(),
                        pid,
                        error: None,
                    }],
                })
            }
            (Action::GracefulShutdown, Target::All) => {
                self.graceful_shutdown();
                Ok(Response::Ack)
            }
            (Action::GracefulShutdown, Target::One(raw)) => {
                self.lookup_service(parse_local_id(raw)?)?.mark_graceful();
                Ok(Response::Ack)
            }
        }
    }

    pub fn summary(&self, target: &Target) -> Result<Vec<ServiceRecord>> {
        let entries = self.entries.lock();
        match target {
            Target::All => Ok(entries
                .iter()
                .map(|(id, e)| service_record(*id, e))
                .collect()),
            Target::One(raw) => {
                let id = parse_local_id(raw)?;
                entries
                    .get(&id)
                    .map(|e| vec![service_record(id, e)])
                    .ok_or_else(|| Error::ServiceNotFound(raw.clone()))
            }
        }
    }

    /// Stop auto-restarting every service without touching the processes.
    pub fn graceful_shutdown(&self) {
        let entries = self.entries.lock();
        for entry in entries.values() {
            entry.supervisor.mark_graceful();
        }
        tracing::info!("{} service(s) will not be restarted on exit", entries.len());
    }

    /// Kill every service and wait for the exits. Every kill is attempted;
    /// failures are collected into one error.
    pub async fn kill_all(&self) -> Result<()> {
        let supervisors: Vec<Supervisor> = self
            .entries
            .lock()
            .values()
            .map(|e| e.supervisor.clone())
            .collect();
        let kills = supervisors.iter().map(|s| async move {
            s.kill(true).await.map_err(|e| {
                tracing::warn!("Failed to kill {}: {}", s.name(), e);
                e
            })
        });
        let errors: Vec<Error> = join_all(kills).await.into_iter().filter_map(|r| r.err()).collect();

        if !errors.is_empty() {
            return Err(Error::Multiple(errors));
        }
        Ok(())
    }

    pub fn snapshots(&self) -> Vec<(u64, ProcessSnapshot)> {
        self.entries
            .lock()
            .iter()
            .map(|(id, e)| (*id, e.supervisor.snapshot()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub(crate) fn parse_local_id(raw: &str) -> Result<u64> {
    raw.parse().map_err(|_| Error::InvalidTarget(raw.to_string()))
}

/// Names and aliases share one namespace within a node.
fn check_aliases(entries: &BTreeMap<u64, Entry>, manifest: &ServiceManifest) -> Result<()> {
    let answers_to =
        |e: &Entry, key: &str| e.manifest.name == key || e.manifest.aliases.iter().any(|a| a == key);
    for key in std::iter::once(&manifest.name).chain(&manifest.aliases) {
        if let Some(owner) = entries.values().find(|e| answers_to(e, key)) {
            return Err(Error::AliasCollision {
                alias: key.clone(),
                owner: owner.manifest.name.clone(),
            });
        }
    }
    Ok(())
}

fn service_record(id: u64, entry: &Entry) -> ServiceRecord {
    let snapshot = entry.supervisor.snapshot();
    ServiceRecord {
        id: id.to_string(),
        name: entry.manifest.name.clone(),
        aliases: entry.manifest.aliases.clone(),
        address: None,
        status: snapshot.status.to_string(),
        state_updated: None,
        pid: snapshot.pid,
        start_time: snapshot.start_time,
        fail_time: snapshot.death_time,
        restart_count: snapshot.restart_count,
        fail_count: snapshot.fail_count,
        errors: snapshot.errors,
        mode: Mode::Managed,
    }
}
