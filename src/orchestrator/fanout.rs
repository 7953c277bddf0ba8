use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::protocol::{self, split_compound, Action, Request, Response, RestartOutcome, ServiceRecord, Target};
use crate::registry::{Record, Registry};

/// Forwards actions and summary requests to registered child nodes.
///
/// Targets for a child are compound ids `<childID>-<serviceID>`; the child
/// part is resolved through the registry and stripped before forwarding.
/// Every call is bounded by `timeout` and made without holding any
/// registry lock.
pub struct Subordinates {
    registry: Arc<Registry>,
    timeout: Duration,
}

impl Subordinates {
    pub fn new(registry: Arc<Registry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    /// Find the running child that owns a compound id.
    fn resolve(&self, compound: &str) -> Result<(Record, String)> {
        let (child, service) =
            split_compound(compound).ok_or_else(|| Error::InvalidTarget(compound.to_string()))?;
        let child_id: u64 = child
            .parse()
            .map_err(|_| Error::InvalidTarget(compound.to_string()))?;
        let record = self.registry.lookup_id(child_id)?;
        if !record.is_running() {
            return Err(Error::AlreadyShutdown(record.name));
        }
        Ok((record, service.to_string()))
    }

    fn running(&self) -> Vec<Record> {
        self.registry
            .records()
            .into_iter()
            .filter(Record::is_running)
            .collect()
    }

    async fn call(&self, record: &Record, request: &Request) -> Result<Response> {
        protocol::call(&record.address, request, self.timeout).await
    }

    /// Forward an action to the one child that owns `compound`.
    pub async fn forward_action(&self, action: Action, compound: &str) -> Result<Response> {
        let (record, service) = self.resolve(compound)?;
        tracing::debug!("Forwarding {:?} of {} to '{}' at {}", action, service, record.name, record.address);

        let request = Request::NotifyAction {
            action,
            target: Target::One(service),
        };
        match self.call(&record, &request).await? {
            Response::Restarted { services } => Ok(Response::Restarted {
                services: prefixed(services, &record),
            }),
            other => Ok(other),
        }
    }

    /// Forward an action for every service to every running child.
    /// Unreachable children are reported as failed outcomes.
    pub async fn forward_action_all(&self, action: Action) -> Vec<RestartOutcome> {
        let request = Request::NotifyAction {
            action,
            target: Target::All,
        };
        let children = self.running();
        let calls = children.iter().map(|record| {
            let request = &request;
            async move { (record, self.call(record, request).await) }
        });

        let mut outcomes = Vec::new();
        for (record, result) in join_all(calls).await {
            match result {
                Ok(Response::Restarted { services }) => outcomes.extend(prefixed(services, record)),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("Forwarding {:?} to '{}' failed: {}", action, record.name, e);
                    outcomes.push(RestartOutcome {
                        id: record.id.to_string(),
                        pid: -1,
                        error: Some(e.to_string()),
                    });
                }
            }
        }
        outcomes
    }

    /// Summary of one service on one child.
    pub async fn summary(&self, compound: &str) -> Result<Vec<ServiceRecord>> {
        let (record, service) = self.resolve(compound)?;
        let request = Request::Summary {
            target: Target::One(service),
        };
        match self.call(&record, &request).await? {
            Response::Summary { services } => Ok(services
                .into_iter()
                .map(|s| s.under_parent(&record.id.to_string()))
                .collect()),
            other => Err(Error::Protocol(format!(
                "unexpected summary response from '{}': {:?}",
                record.name, other
            ))),
        }
    }

    /// Concatenated summaries of every running child. A child that cannot
    /// answer shows up as one placeholder record instead.
    pub async fn summary_all(&self) -> Vec<ServiceRecord> {
        let request = Request::Summary { target: Target::All };
        let children = self.running();
        let calls = children.iter().map(|record| {
            let request = &request;
            async move { (record, self.call(record, request).await) }
        });

        let mut services = Vec::new();
        for (record, result) in join_all(calls).await {
            let parent = record.id.to_string();
            match result {
                Ok(Response::Summary { services: reported }) => {
                    services.extend(reported.into_iter().map(|s| s.under_parent(&parent)))
                }
                Ok(other) => {
                    let err = Error::Protocol(format!("unexpected summary response: {:?}", other));
                    services.push(ServiceRecord::unreachable(parent, record.name.clone(), &err));
                }
                Err(e) => {
                    tracing::debug!("Summary from '{}' failed: {}", record.name, e);
                    services.push(ServiceRecord::unreachable(parent, record.name.clone(), &e));
                }
            }
        }
        services
    }
}

fn prefixed(services: Vec<RestartOutcome>, record: &Record) -> Vec<RestartOutcome> {
    let parent = record.id.to_string();
    services
        .into_iter()
        .map(|mut outcome| {
            outcome.id = protocol::compound_id(&parent, &outcome.id);
            outcome
        })
        .collect()
}

/// Whether a target names a service on a child rather than a local one.
pub(crate) fn is_forwarded(target: &Target) -> bool {
    matches!(target, Target::One(id) if split_compound(id).is_some())
}
