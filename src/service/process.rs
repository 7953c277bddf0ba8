use super::{LaunchSpec, ProcessSnapshot, Status};
use crate::config::humane;
use crate::error::{validate_pid, Error, Result};
use chrono::{DateTime, Utc};
use nix::sys::signal::{self, killpg, Signal};
use serde::{Deserialize, Serialize};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Child;
use tokio::sync::watch;

/// Synchronous mutex for the runtime record. It is never held across an
/// await point, so parking_lot is used rather than tokio's async mutex.
type SyncMutex<T> = parking_lot::Mutex<T>;

/// Oldest entries are dropped once a supervisor has recorded this many errors.
const MAX_ERRORS: usize = 32;

/// How long to wait for the process to be reaped after SIGKILL.
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// Failure-recovery parameters shared by every launch kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorPolicy {
    /// Continuous run time after which a process counts as stable, and after
    /// which a failure no longer counts against the restart budget.
    #[serde(with = "humane")]
    pub stability_window: Duration,
    /// Automatic restarts allowed within one crash run.
    pub retry_budget: u32,
    /// Delay before each automatic restart.
    #[serde(with = "humane")]
    pub backoff: Duration,
    /// Time between SIGTERM and SIGKILL.
    #[serde(with = "humane")]
    pub grace_period: Duration,
}

impl Default for SupervisorPolicy {
    fn default() -> Self {
        Self {
            stability_window: Duration::from_secs(30),
            retry_budget: 3,
            backoff: Duration::from_secs(2),
            grace_period: Duration::from_secs(5),
        }
    }
}

/// Mutable lifecycle record. Only the supervisor writes to it.
#[derive(Debug)]
struct Runtime {
    status: Status,
    pid: i32,
    start_time: Option<DateTime<Utc>>,
    started_at: Option<Instant>,
    death_time: Option<DateTime<Utc>>,
    restart_count: u32,
    fail_count: u32,
    manual_restarts: u32,
    errors: Vec<String>,
    /// Next exit is expected and must not trigger a restart
    graceful: bool,
    /// Bumped on every launch; lets observers of old processes recognise themselves
    generation: u64,
}

impl Runtime {
    fn new() -> Self {
        Self {
            status: Status::Initialized,
            pid: -1,
            start_time: None,
            started_at: None,
            death_time: None,
            restart_count: 0,
            fail_count: 0,
            manual_restarts: 0,
            errors: Vec::new(),
            graceful: false,
            generation: 0,
        }
    }

    fn transition(&mut self, service: &str, to: Status) {
        if !self.status.is_valid_transition(to) {
            tracing::warn!(
                service.name = service,
                "Unexpected status transition {} -> {}",
                self.status,
                to
            );
        } else if self.status != to {
            tracing::debug!(service.name = service, "{} -> {}", self.status, to);
        }
        self.status = to;
    }

    fn record_error(&mut self, message: String) {
        if self.errors.len() == MAX_ERRORS {
            self.errors.remove(0);
        }
        self.errors.push(message);
    }
}

/// What the exit observer decided after a process went away.
enum ExitDisposition {
    /// A newer process has already been launched
    Stale,
    /// Killed, graceful shutdown, or a caller-driven restart
    Expected,
    Failure,
}

struct Inner {
    name: String,
    launch: LaunchSpec,
    policy: SupervisorPolicy,
    runtime: SyncMutex<Runtime>,
    /// Generation of the latest process whose exit has been observed.
    exits: watch::Sender<u64>,
}

/// Owns the lifecycle of one externally launched executable.
///
/// Cloning is cheap and every clone controls the same process. Callers only
/// ever request `start`, `restart` and `kill`; state changes themselves are
/// made by the supervisor and its exit observer task.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(name: impl Into<String>, launch: LaunchSpec, policy: SupervisorPolicy) -> Self {
        let (exits, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                launch,
                policy,
                runtime: SyncMutex::new(Runtime::new()),
                exits,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn policy(&self) -> &SupervisorPolicy {
        &self.inner.policy
    }

    pub fn launch_spec(&self) -> &LaunchSpec {
        &self.inner.launch
    }

    pub fn status(&self) -> Status {
        self.inner.runtime.lock().status
    }

    pub fn snapshot(&self) -> ProcessSnapshot {
        let rt = self.inner.runtime.lock();
        ProcessSnapshot {
            status: rt.status,
            start_time: rt.start_time,
            death_time: rt.death_time,
            pid: rt.pid,
            restart_count: rt.restart_count,
            fail_count: rt.fail_count,
            manual_restarts: rt.manual_restarts,
            errors: rt.errors.clone(),
        }
    }

    /// Launch the process and return its PID.
    ///
    /// Starting a process that is already alive is a no-op. A failed or
    /// killed process is brought back through [`Supervisor::restart`].
    #[tracing::instrument(skip(self), fields(service.name = %self.inner.name))]
    pub async fn start(&self) -> Result<i32> {
        // `None` means the process has run before and goes through restart
        let launched = {
            let mut rt = self.inner.runtime.lock();
            let status = rt.status;
            if status.is_alive() {
                return Ok(rt.pid);
            }
            match status {
                Status::Initialized => Some(self.launch_locked(&mut rt)?),
                Status::Restarting => {
                    return Err(Error::RestartInProgress(self.inner.name.clone()))
                }
                _ => None,
            }
        };
        let Some((child, generation, pid)) = launched else {
            return self.restart(false).await;
        };
        self.spawn_exit_observer(child, generation);
        Ok(pid)
    }

    /// Restart the process.
    ///
    /// A caller-requested restart (`from_failure == false`) resets the
    /// automatic restart counter, terminates a running process and waits for
    /// its exit before relaunching. The failure path skips termination since
    /// the process is already gone.
    #[tracing::instrument(skip(self), fields(service.name = %self.inner.name))]
    pub async fn restart(&self, from_failure: bool) -> Result<i32> {
        let (terminate, generation) = {
            let mut rt = self.inner.runtime.lock();
            match rt.status {
                Status::Restarting => {
                    return Err(Error::RestartInProgress(self.inner.name.clone()))
                }
                Status::Initialized => return Err(Error::NotStarted(self.inner.name.clone())),
                _ => {}
            }
            if from_failure && rt.status != Status::Failed {
                // Someone else already dealt with the failure
                tracing::debug!("Skipping automatic restart, status is {}", rt.status);
                return Ok(rt.pid);
            }
            if !from_failure {
                rt.restart_count = 0;
                rt.manual_restarts += 1;
            }
            let terminate = (!from_failure && rt.status.is_alive() && rt.pid > 0).then_some(rt.pid);
            rt.transition(&self.inner.name, Status::Restarting);
            (terminate, rt.generation)
        };

        if let Some(pid) = terminate {
            tracing::info!("Stopping PID {} before restart", pid);
            if let Err(e) = self.terminate(pid, generation).await {
                tracing::warn!("Relaunching anyway: {}", e);
            }
        }

        let (child, generation, pid) = {
            let mut rt = self.inner.runtime.lock();
            if rt.status != Status::Restarting {
                tracing::info!("Restart abandoned, status changed to {}", rt.status);
                return Ok(rt.pid);
            }
            self.launch_locked(&mut rt)?
        };
        self.spawn_exit_observer(child, generation);
        Ok(pid)
    }

    /// Send SIGTERM to the process group.
    ///
    /// With `without_restart` the process is marked `Killed` first, so its
    /// exit is treated as intentional, and the call waits for the exit
    /// (escalating to SIGKILL after the grace period). Without it the exit
    /// looks like any other failure and the restart budget applies.
    #[tracing::instrument(skip(self), fields(service.name = %self.inner.name))]
    pub async fn kill(&self, without_restart: bool) -> Result<()> {
        let (pid, generation) = {
            let mut rt = self.inner.runtime.lock();
            if without_restart && rt.status != Status::Killed {
                rt.transition(&self.inner.name, Status::Killed);
            }
            (rt.pid, rt.generation)
        };

        if pid <= 0 {
            return Ok(());
        }

        if without_restart {
            self.terminate(pid, generation).await
        } else {
            signal_group(pid, Signal::SIGTERM, &self.inner.name)
        }
    }

    /// Suppress the automatic restart on the next exit without touching the
    /// process. Used when the parent is going away and children should be
    /// left to finish their own work.
    pub fn mark_graceful(&self) {
        let mut rt = self.inner.runtime.lock();
        if !rt.graceful {
            tracing::debug!(service.name = %self.inner.name, "Marked for graceful shutdown");
        }
        rt.graceful = true;
    }

    /// Wait until the process of the given generation has been observed to exit.
    async fn wait_for_exit(&self, generation: u64, limit: Duration) -> bool {
        let mut exits = self.inner.exits.subscribe();
        let waited = tokio::time::timeout(limit, exits.wait_for(|g| *g >= generation)).await;
        matches!(waited, Ok(Ok(_)))
    }

    /// SIGTERM, wait for the exit observer, SIGKILL if the grace period runs out.
    async fn terminate(&self, pid: i32, generation: u64) -> Result<()> {
        let name = &self.inner.name;
        if let Err(e) = signal_group(pid, Signal::SIGTERM, name) {
            tracing::warn!("Failed to signal PID {} for '{}': {}", pid, name, e);
        }

        let grace = self.inner.policy.grace_period;
        if self.wait_for_exit(generation, grace).await {
            return Ok(());
        }

        tracing::warn!(
            "Process {} did not exit after SIGTERM (grace period: {:?}), sending SIGKILL",
            name,
            grace
        );
        let _ = signal_group(pid, Signal::SIGKILL, name);
        if !self.wait_for_exit(generation, KILL_REAP_TIMEOUT).await {
            tracing::error!("Process {} (PID {}) survived SIGKILL", name, pid);
            return Err(Error::Process(format!("'{}' (PID {}) survived SIGKILL", name, pid)));
        }
        Ok(())
    }

    /// Spawn the process while the runtime lock is held, so two callers can
    /// never launch twice. Spawning is a synchronous fork/exec.
    fn launch_locked(&self, rt: &mut Runtime) -> Result<(Child, u64, i32)> {
        let name = &self.inner.name;
        let spawned = self
            .inner
            .launch
            .command(name)
            .and_then(|mut cmd| {
                cmd.spawn().map_err(|e| Error::Launch {
                    service: name.clone(),
                    reason: e.to_string(),
                })
            });

        let child = match spawned {
            Ok(child) => child,
            Err(e) => {
                tracing::error!("Failed to launch '{}': {}", name, e);
                rt.record_error(e.to_string());
                rt.pid = -1;
                if rt.status == Status::Restarting {
                    rt.transition(name, Status::Failed);
                }
                return Err(e);
            }
        };

        let pid = child.id().map(|p| p as i32).unwrap_or(-1);
        rt.generation += 1;
        rt.pid = pid;
        rt.start_time = Some(Utc::now());
        rt.started_at = Some(Instant::now());
        rt.graceful = false;
        rt.transition(name, Status::Running);
        tracing::info!(
            "Started '{}' ({}) with PID {}",
            name,
            self.inner.launch.kind.label(),
            pid
        );
        Ok((child, rt.generation, pid))
    }

    /// Watch one process until it exits, promoting it to `Stable` if it
    /// outlives the stability window.
    fn spawn_exit_observer(&self, mut child: Child, generation: u64) {
        let this = self.clone();
        tokio::spawn(async move {
            let window = tokio::time::sleep(this.inner.policy.stability_window);
            tokio::pin!(window);
            let mut promoted = false;

            let exit = loop {
                tokio::select! {
                    exit = child.wait() => break exit,
                    _ = &mut window, if !promoted => {
                        promoted = true;
                        this.promote(generation);
                    }
                }
            };

            let description = match exit {
                Ok(status) => describe_exit(status),
                Err(e) => format!("lost track of process: {}", e),
            };
            this.on_exit(generation, description).await;
        });
    }

    fn promote(&self, generation: u64) {
        let mut rt = self.inner.runtime.lock();
        if rt.generation == generation && rt.status == Status::Running {
            rt.transition(&self.inner.name, Status::Stable);
            tracing::info!("'{}' is stable", self.inner.name);
        }
    }

    async fn on_exit(&self, generation: u64, description: String) {
        let disposition = {
            let mut rt = self.inner.runtime.lock();
            if rt.generation != generation {
                ExitDisposition::Stale
            } else {
                rt.pid = -1;
                rt.death_time = Some(Utc::now());
                if rt.status == Status::Killed || rt.graceful {
                    if rt.status != Status::Killed {
                        rt.transition(&self.inner.name, Status::Killed);
                    }
                    tracing::info!("'{}' {} as requested", self.inner.name, description);
                    ExitDisposition::Expected
                } else if rt.status == Status::Restarting {
                    ExitDisposition::Expected
                } else {
                    ExitDisposition::Failure
                }
            }
        };

        // Publish only after the runtime reflects the exit
        self.inner
            .exits
            .send_modify(|observed| *observed = (*observed).max(generation));

        if let ExitDisposition::Failure = disposition {
            self.handle_failure(generation, description).await;
        }
    }

    async fn handle_failure(&self, generation: u64, description: String) {
        let policy = &self.inner.policy;
        let name = &self.inner.name;

        let attempt = {
            let mut rt = self.inner.runtime.lock();
            let ran_for = rt.started_at.map(|t| t.elapsed()).unwrap_or_default();
            rt.transition(name, Status::Failed);
            rt.record_error(format!("{} after {:.1}s", description, ran_for.as_secs_f64()));

            // A long healthy run is a fresh start, not part of a crash loop
            if ran_for > policy.stability_window {
                rt.restart_count = 0;
            }

            if rt.restart_count < policy.retry_budget {
                rt.restart_count += 1;
                rt.fail_count += 1;
                Some(rt.restart_count)
            } else {
                rt.record_error(format!(
                    "restart budget of {} exhausted, manual restart required",
                    policy.retry_budget
                ));
                None
            }
        };

        let Some(attempt) = attempt else {
            tracing::error!(
                "'{}' {} and has used its restart budget ({}); leaving it failed",
                name,
                description,
                policy.retry_budget
            );
            return;
        };

        tracing::warn!(
            "'{}' {}; restarting in {:?} (attempt {}/{})",
            name,
            description,
            policy.backoff,
            attempt,
            policy.retry_budget
        );
        tokio::time::sleep(policy.backoff).await;

        {
            let rt = self.inner.runtime.lock();
            if rt.generation != generation || rt.status != Status::Failed || rt.graceful {
                tracing::debug!("'{}' changed during backoff, not restarting", name);
                return;
            }
        }

        if let Err(e) = self.restart(true).await {
            tracing::error!("Automatic restart of '{}' failed: {}", name, e);
        }
    }
}

/// Signal the whole process group, falling back to the single process.
fn signal_group(pid: i32, sig: Signal, service: &str) -> Result<()> {
    let pid = validate_pid(pid, service)?;
    killpg(pid, sig)
        .or_else(|_| signal::kill(pid, sig))
        .map_err(|e| Error::Process(format!("failed to send {} to '{}': {}", sig, service, e)))
}

fn describe_exit(status: ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exited with code {}", code),
        (None, Some(sig)) => format!("killed by signal {}", sig),
        _ => "exited".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> LaunchSpec {
        LaunchSpec::binary("/bin/sh", vec!["-c".to_string(), script.to_string()])
    }

    fn quick_policy() -> SupervisorPolicy {
        SupervisorPolicy {
            stability_window: Duration::from_secs(30),
            retry_budget: 3,
            backoff: Duration::from_millis(20),
            grace_period: Duration::from_secs(2),
        }
    }

    #[tokio::test]
    async fn test_restart_before_start_is_rejected() {
        let sup = Supervisor::new("idle", sh("sleep 5"), quick_policy());
        assert!(matches!(sup.restart(false).await, Err(Error::NotStarted(_))));
        assert_eq!(sup.status(), Status::Initialized);
    }

    #[tokio::test]
    async fn test_launch_error_is_immediate_and_not_retried() {
        let sup = Supervisor::new(
            "missing",
            LaunchSpec::binary("/nonexistent/bin/service", vec![]),
            quick_policy(),
        );
        assert!(matches!(sup.start().await, Err(Error::Launch { .. })));

        let snap = sup.snapshot();
        assert_eq!(snap.status, Status::Initialized);
        assert_eq!(snap.pid, -1);
        assert_eq!(snap.fail_count, 0);
        assert_eq!(snap.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_start_is_idempotent_while_alive() {
        let sup = Supervisor::new("sleeper", sh("sleep 5"), quick_policy());
        let pid = sup.start().await.unwrap();
        assert!(pid > 1);
        assert_eq!(sup.start().await.unwrap(), pid);
        sup.kill(true).await.unwrap();
        assert_eq!(sup.status(), Status::Killed);
        assert_eq!(sup.snapshot().pid, -1);
    }

    #[tokio::test]
    async fn test_start_after_kill_relaunches_on_spawned_task() {
        let sup = Supervisor::new("respawn", sh("sleep 5"), quick_policy());
        let first = sup.start().await.unwrap();
        sup.kill(true).await.unwrap();

        // tokio::spawn needs the start future to be Send
        let relaunch = tokio::spawn({
            let sup = sup.clone();
            async move { sup.start().await }
        });
        let second = relaunch.await.unwrap().unwrap();
        assert!(second > 1 && second != first);
        assert_eq!(sup.status(), Status::Running);
        assert_eq!(sup.snapshot().manual_restarts, 1);

        sup.kill(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_manual_restarts_collapse() {
        let sup = Supervisor::new("busy", sh("sleep 5"), quick_policy());
        let first = sup.start().await.unwrap();

        let (a, b) = tokio::join!(sup.restart(false), sup.restart(false));
        let pid = a.unwrap();
        assert!(matches!(b, Err(Error::RestartInProgress(_))));
        assert!(pid > 1 && pid != first);
        assert_eq!(sup.snapshot().pid, pid);

        sup.kill(true).await.unwrap();
        assert_eq!(sup.snapshot().pid, -1);
    }

    #[test]
    fn test_policy_defaults() {
        let policy = SupervisorPolicy::default();
        assert_eq!(policy.stability_window, Duration::from_secs(30));
        assert_eq!(policy.retry_budget, 3);
        assert_eq!(policy.backoff, Duration::from_secs(2));
    }

    #[test]
    fn test_error_log_is_bounded() {
        let mut rt = Runtime::new();
        for i in 0..(MAX_ERRORS + 5) {
            rt.record_error(format!("error {}", i));
        }
        assert_eq!(rt.errors.len(), MAX_ERRORS);
        assert_eq!(rt.errors[0], "error 5");
    }
}
