use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use super::{ControlProbe, LivenessProbe, Record, RecordState};
use crate::config::ReclaimPolicy;
use crate::error::{Error, Result};
use crate::port::AddressAllocator;
use crate::protocol::{self, Mode, Request, CORE_SHUTDOWN};

/// Outcome of [`Registry::send_shutdown_notices`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub delivered: Vec<String>,
    pub failed: Vec<String>,
}

impl ShutdownReport {
    pub fn attempted(&self) -> usize {
        self.delivered.len() + self.failed.len()
    }
}

#[derive(Debug)]
struct State {
    records: HashMap<String, Record>,
    /// alias -> owning name
    aliases: HashMap<String, String>,
    next_id: u64,
    allocator: AddressAllocator,
}

impl State {
    /// Who already answers to `key`, either as a name or as an alias.
    fn owner_of(&self, key: &str) -> Option<&str> {
        if let Some(record) = self.records.get(key) {
            return Some(record.name.as_str());
        }
        self.aliases.get(key).map(String::as_str)
    }

    fn insert(&mut self, name: &str, aliases: Vec<String>, mode: Mode, address: String) -> Result<Record> {
        if let Some(owner) = self.aliases.get(name) {
            return Err(Error::AliasCollision {
                alias: name.to_string(),
                owner: owner.clone(),
            });
        }
        for alias in &aliases {
            if alias == name {
                continue;
            }
            if let Some(owner) = self.owner_of(alias) {
                return Err(Error::AliasCollision {
                    alias: alias.clone(),
                    owner: owner.to_string(),
                });
            }
        }

        let aliases: Vec<String> = aliases
            .into_iter()
            .filter(|a| a != name)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let id = self.next_id;
        self.next_id += 1;
        let record = Record::new(id, name, aliases, address, mode);
        for alias in &record.aliases {
            self.aliases.insert(alias.clone(), name.to_string());
        }
        self.records.insert(name.to_string(), record.clone());

        tracing::info!(
            registry.id = id,
            "Registered '{}' at {}",
            name,
            record.address
        );
        Ok(record)
    }

    fn reclaim(&mut self, name: &str, address: String) -> Result<Record> {
        let record = self
            .records
            .get_mut(name)
            .ok_or_else(|| Error::UnknownIdentity(name.to_string()))?;
        record.reclaim(address);
        tracing::info!(
            registry.id = record.id,
            "Reclaimed slot for '{}', now at {}",
            name,
            record.address
        );
        Ok(record.clone())
    }
}

/// Name and address book for the services or subordinate nodes attached to
/// one node.
///
/// Every mutation happens under one lock; the lock is released before any
/// network call (liveness probes, shutdown notices).
pub struct Registry {
    state: Mutex<State>,
    probe: Arc<dyn LivenessProbe>,
    reclaim: ReclaimPolicy,
    notice_timeout: Duration,
}

impl Registry {
    pub fn new(allocator: AddressAllocator, reclaim: ReclaimPolicy) -> Self {
        Self {
            state: Mutex::new(State {
                records: HashMap::new(),
                aliases: HashMap::new(),
                next_id: 1,
                allocator,
            }),
            probe: Arc::new(ControlProbe::default()),
            reclaim,
            notice_timeout: Duration::from_millis(500),
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn LivenessProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_notice_timeout(mut self, timeout: Duration) -> Self {
        self.notice_timeout = timeout;
        self
    }

    /// Register `name`, or hand its slot to the caller when the previous
    /// holder is known (or found) to be gone.
    #[tracing::instrument(skip(self, aliases))]
    pub async fn add_service(&self, name: &str, aliases: &[String], mode: Mode) -> Result<Record> {
        if name.trim().is_empty() {
            return Err(Error::Parse("registration name must not be empty".to_string()));
        }

        let holder = {
            let mut state = self.state.lock();
            match state.records.get(name).map(|r| (r.state, r.address.clone())) {
                Some((RecordState::Shutdown, _)) => {
                    let address = state.allocator.next_address()?;
                    return state.reclaim(name, address);
                }
                Some((RecordState::Running, holder)) => holder,
                None => {
                    let address = state.allocator.next_address()?;
                    return state.insert(name, aliases.to_vec(), mode, address);
                }
            }
        };

        if self.reclaim == ReclaimPolicy::Never {
            return Err(Error::DuplicateName(name.to_string()));
        }

        // No address is drawn for a name whose holder is still alive
        if self.probe.is_alive(&holder).await {
            tracing::warn!("Rejecting '{}': current holder at {} is alive", name, holder);
            return Err(Error::DuplicateName(name.to_string()));
        }

        let mut state = self.state.lock();
        match state.records.get(name).map(|r| (r.state, r.address.clone())) {
            // Nobody touched the slot while we probed
            Some((RecordState::Running, current)) if current == holder => {
                tracing::info!("Holder of '{}' at {} is unreachable", name, holder);
                let address = state.allocator.next_address()?;
                state.reclaim(name, address)
            }
            Some((RecordState::Shutdown, _)) => {
                let address = state.allocator.next_address()?;
                state.reclaim(name, address)
            }
            Some((RecordState::Running, _)) => Err(Error::DuplicateName(name.to_string())),
            None => {
                let address = state.allocator.next_address()?;
                state.insert(name, aliases.to_vec(), mode, address)
            }
        }
    }

    /// Accept a heartbeat from the holder of `name`.
    pub fn verify(&self, name: &str, fingerprint: &str) -> Result<()> {
        let mut state = self.state.lock();
        let record = state
            .records
            .get_mut(name)
            .ok_or_else(|| Error::UnknownIdentity(name.to_string()))?;
        if record.state == RecordState::Shutdown {
            return Err(Error::AlreadyShutdown(name.to_string()));
        }
        if record.fingerprint != fingerprint {
            tracing::debug!("Heartbeat for '{}' carries a stale fingerprint", name);
            return Err(Error::FingerprintMismatch(name.to_string()));
        }
        record.last_ping = Some(Utc::now());
        record.heartbeats += 1;
        Ok(())
    }

    /// The holder of `name` reports that it has shut down.
    pub fn mark_shutdown(&self, name: &str, fingerprint: &str) -> Result<Record> {
        let mut state = self.state.lock();
        let record = state
            .records
            .get_mut(name)
            .ok_or_else(|| Error::UnknownIdentity(name.to_string()))?;
        if record.fingerprint != fingerprint {
            return Err(Error::FingerprintMismatch(name.to_string()));
        }
        if record.state != RecordState::Shutdown {
            record.set_state(RecordState::Shutdown);
            tracing::info!(registry.id = record.id, "'{}' reported shutdown", name);
        }
        Ok(record.clone())
    }

    /// Resolve a name or alias.
    pub fn lookup_service(&self, name: &str) -> Result<Record> {
        let state = self.state.lock();
        let owner = state
            .owner_of(name)
            .ok_or_else(|| Error::ServiceNotFound(name.to_string()))?;
        state
            .records
            .get(owner)
            .cloned()
            .ok_or_else(|| Error::ServiceNotFound(name.to_string()))
    }

    pub fn lookup_id(&self, id: u64) -> Result<Record> {
        self.state
            .lock()
            .records
            .values()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| Error::ServiceNotFound(id.to_string()))
    }

    /// All records, ordered by id.
    pub fn records(&self) -> Vec<Record> {
        let mut records: Vec<Record> = self.state.lock().records.values().cloned().collect();
        records.sort_by_key(|r| r.id);
        records
    }

    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tell every running holder that this node is shutting down.
    ///
    /// Notices go out concurrently, each bounded by the notice timeout, and
    /// the call returns once every one of them has been attempted. Holders
    /// that received the notice are marked `Shutdown` so they can reclaim
    /// their slot if they come back.
    pub async fn send_shutdown_notices(&self) -> ShutdownReport {
        let targets: Vec<(String, String, String)> = self
            .state
            .lock()
            .records
            .values()
            .filter(|r| r.is_running())
            .map(|r| (r.name.clone(), r.address.clone(), r.fingerprint.clone()))
            .collect();

        if targets.is_empty() {
            return ShutdownReport::default();
        }
        tracing::info!("Sending shutdown notices to {} holder(s)", targets.len());

        let timeout = self.notice_timeout;
        let notices = targets.into_iter().map(|(name, address, fingerprint)| async move {
            let request = Request::UpdateRegistration {
                reason: CORE_SHUTDOWN.to_string(),
            };
            let outcome = protocol::call(&address, &request, timeout).await;
            (name, address, fingerprint, outcome)
        });
        let outcomes = join_all(notices).await;

        let mut report = ShutdownReport::default();
        let mut state = self.state.lock();
        for (name, address, fingerprint, outcome) in outcomes {
            match outcome {
                Ok(_) => {
                    if let Some(record) = state.records.get_mut(&name) {
                        if record.fingerprint == fingerprint {
                            record.set_state(RecordState::Shutdown);
                        }
                    }
                    report.delivered.push(name);
                }
                Err(e) => {
                    // Already gone is fine
                    tracing::debug!("Shutdown notice to '{}' at {} failed: {}", name, address, e);
                    report.failed.push(name);
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FixedProbe(AtomicBool);

    #[async_trait]
    impl LivenessProbe for FixedProbe {
        async fn is_alive(&self, _address: &str) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn registry(alive: bool, policy: ReclaimPolicy) -> Registry {
        Registry::new(AddressAllocator::new("127.0.0.1", 40000, 40100), policy)
            .with_probe(Arc::new(FixedProbe(AtomicBool::new(alive))))
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_alias_collision_leaves_registry_unchanged() {
        let reg = registry(true, ReclaimPolicy::OnUnreachable);
        let a = reg.add_service("A", &names(&["a1"]), Mode::Remote).await.unwrap();

        let err = reg.add_service("B", &names(&["a1"]), Mode::Remote).await.unwrap_err();
        assert!(matches!(err, Error::AliasCollision { ref alias, ref owner } if alias == "a1" && owner == "A"));

        assert_eq!(reg.records(), vec![a]);
        assert!(reg.lookup_service("B").is_err());
        assert_eq!(reg.lookup_service("a1").unwrap().name, "A");
    }

    #[tokio::test]
    async fn test_name_cannot_shadow_an_alias() {
        let reg = registry(true, ReclaimPolicy::OnUnreachable);
        reg.add_service("A", &names(&["api"]), Mode::Remote).await.unwrap();
        assert!(matches!(
            reg.add_service("api", &[], Mode::Remote).await,
            Err(Error::AliasCollision { .. })
        ));
        assert!(matches!(
            reg.add_service("B", &names(&["A"]), Mode::Remote).await,
            Err(Error::AliasCollision { .. })
        ));
    }

    #[tokio::test]
    async fn test_live_duplicate_is_rejected() {
        let reg = registry(true, ReclaimPolicy::OnUnreachable);
        let first = reg.add_service("A", &[], Mode::Remote).await.unwrap();
        assert!(matches!(
            reg.add_service("A", &[], Mode::Remote).await,
            Err(Error::DuplicateName(_))
        ));
        assert_eq!(reg.lookup_service("A").unwrap(), first);
    }

    #[tokio::test]
    async fn test_unreachable_holder_is_reclaimed() {
        let reg = registry(false, ReclaimPolicy::OnUnreachable);
        let first = reg.add_service("A", &[], Mode::Remote).await.unwrap();
        let second = reg.add_service("A", &[], Mode::Remote).await.unwrap();

        assert_eq!(second.id, first.id);
        assert_ne!(second.fingerprint, first.fingerprint);
        assert_ne!(second.address, first.address);
        assert!(reg.verify("A", &first.fingerprint).is_err());
        assert!(reg.verify("A", &second.fingerprint).is_ok());
    }

    #[tokio::test]
    async fn test_never_policy_only_reclaims_shutdown_slots() {
        let reg = registry(false, ReclaimPolicy::Never);
        let first = reg.add_service("A", &[], Mode::Remote).await.unwrap();
        assert!(matches!(
            reg.add_service("A", &[], Mode::Remote).await,
            Err(Error::DuplicateName(_))
        ));

        reg.mark_shutdown("A", &first.fingerprint).unwrap();
        let second = reg.add_service("A", &[], Mode::Remote).await.unwrap();
        assert_eq!(second.id, first.id);
        assert!(second.is_running());
    }

    #[tokio::test]
    async fn test_verify_rules() {
        let reg = registry(true, ReclaimPolicy::OnUnreachable);
        let record = reg.add_service("A", &[], Mode::Remote).await.unwrap();

        assert!(matches!(reg.verify("Z", "x"), Err(Error::UnknownIdentity(_))));
        assert!(matches!(
            reg.verify("A", "not-the-fingerprint"),
            Err(Error::FingerprintMismatch(_))
        ));
        assert!(reg.lookup_service("A").unwrap().last_ping.is_none());

        reg.verify("A", &record.fingerprint).unwrap();
        reg.verify("A", &record.fingerprint).unwrap();
        let after = reg.lookup_service("A").unwrap();
        assert!(after.last_ping.is_some());
        assert_eq!(after.heartbeats, 2);

        reg.mark_shutdown("A", &record.fingerprint).unwrap();
        assert!(matches!(
            reg.verify("A", &record.fingerprint),
            Err(Error::AlreadyShutdown(_))
        ));
    }

    #[tokio::test]
    async fn test_ids_are_not_reused_and_lookup_by_id() {
        let reg = registry(true, ReclaimPolicy::OnUnreachable);
        let a = reg.add_service("A", &[], Mode::Remote).await.unwrap();
        let b = reg.add_service("B", &[], Mode::Remote).await.unwrap();
        assert_eq!((a.id, b.id), (1, 2));
        assert_eq!(reg.lookup_id(2).unwrap().name, "B");
        assert!(matches!(reg.lookup_id(9), Err(Error::ServiceNotFound(_))));
    }

    #[tokio::test]
    async fn test_exhausted_range_is_an_error() {
        let reg = Registry::new(AddressAllocator::new("127.0.0.1", 40000, 40002), ReclaimPolicy::Never);
        reg.add_service("A", &[], Mode::Remote).await.unwrap();
        assert!(matches!(
            reg.add_service("B", &[], Mode::Remote).await,
            Err(Error::AddressExhausted { .. })
        ));
    }

    #[tokio::test]
    async fn test_live_duplicate_on_exhausted_range_is_still_a_duplicate() {
        // Room for exactly one address
        let reg = Registry::new(AddressAllocator::new("127.0.0.1", 40000, 40002), ReclaimPolicy::OnUnreachable)
            .with_probe(Arc::new(FixedProbe(AtomicBool::new(true))));
        let first = reg.add_service("A", &[], Mode::Remote).await.unwrap();

        assert!(matches!(
            reg.add_service("A", &[], Mode::Remote).await,
            Err(Error::DuplicateName(_))
        ));
        let never = Registry::new(AddressAllocator::new("127.0.0.1", 40000, 40002), ReclaimPolicy::Never);
        never.add_service("A", &[], Mode::Remote).await.unwrap();
        assert!(matches!(
            never.add_service("A", &[], Mode::Remote).await,
            Err(Error::DuplicateName(_))
        ));
        assert_eq!(reg.lookup_service("A").unwrap(), first);
    }

    #[tokio::test]
    async fn test_rejected_duplicate_does_not_use_an_address() {
        let reg = registry(true, ReclaimPolicy::OnUnreachable);
        let a = reg.add_service("A", &[], Mode::Remote).await.unwrap();
        reg.add_service("A", &[], Mode::Remote).await.unwrap_err();
        let b = reg.add_service("B", &[], Mode::Remote).await.unwrap();
        assert_eq!(a.address, "127.0.0.1:40000");
        assert_eq!(b.address, "127.0.0.1:40002");
    }

    #[tokio::test]
    async fn test_state_changes_are_timestamped() {
        let reg = registry(true, ReclaimPolicy::OnUnreachable);
        let record = reg.add_service("A", &[], Mode::Remote).await.unwrap();
        assert_eq!(record.state_updated, record.added);

        tokio::time::sleep(Duration::from_millis(5)).await;
        let shut = reg.mark_shutdown("A", &record.fingerprint).unwrap();
        assert!(shut.state_updated > record.state_updated);

        // A heartbeat is not a state change
        let back = reg.add_service("A", &[], Mode::Remote).await.unwrap();
        assert!(back.state_updated >= shut.state_updated);
        reg.verify("A", &back.fingerprint).unwrap();
        assert_eq!(reg.lookup_service("A").unwrap().state_updated, back.state_updated);
    }

    #[tokio::test]
    async fn test_notices_to_dead_holders_are_tolerated() {
        // Nothing listens on these ports
        let reg = registry(true, ReclaimPolicy::OnUnreachable).with_notice_timeout(Duration::from_millis(200));
        reg.add_service("A", &[], Mode::Remote).await.unwrap();
        reg.add_service("B", &[], Mode::Remote).await.unwrap();

        let report = reg.send_shutdown_notices().await;
        assert_eq!(report.attempted(), 2);
        assert!(report.delivered.is_empty());
        assert!(reg.records().iter().all(|r| r.is_running()));
    }
}
