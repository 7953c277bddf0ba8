use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::protocol::{Mode, ServiceRecord};

const FINGERPRINT_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordState {
    Running,
    Shutdown,
}

impl fmt::Display for RecordState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordState::Running => f.write_str("running"),
            RecordState::Shutdown => f.write_str("shutdown"),
        }
    }
}

/// One registry slot. The id survives reclamation; address and fingerprint
/// do not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: u64,
    pub name: String,
    pub aliases: Vec<String>,
    pub address: String,
    pub fingerprint: String,
    pub state: RecordState,
    pub mode: Mode,
    pub added: DateTime<Utc>,
    pub state_updated: DateTime<Utc>,
    pub last_ping: Option<DateTime<Utc>>,
    /// Heartbeats accepted under the current fingerprint
    pub heartbeats: u64,
}

impl Record {
    pub(super) fn new(id: u64, name: &str, aliases: Vec<String>, address: String, mode: Mode) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.to_string(),
            aliases,
            address,
            fingerprint: new_fingerprint(),
            state: RecordState::Running,
            mode,
            added: now,
            state_updated: now,
            last_ping: None,
            heartbeats: 0,
        }
    }

    /// Hand the slot to a new holder.
    pub(super) fn reclaim(&mut self, address: String) {
        self.address = address;
        self.fingerprint = new_fingerprint();
        self.set_state(RecordState::Running);
        self.last_ping = None;
        self.heartbeats = 0;
    }

    /// Change state, stamping the time of the change.
    pub(super) fn set_state(&mut self, state: RecordState) {
        self.state = state;
        self.state_updated = Utc::now();
    }

    pub fn is_running(&self) -> bool {
        self.state == RecordState::Running
    }

    pub fn answers_to(&self, name: &str) -> bool {
        self.name == name || self.aliases.iter().any(|a| a == name)
    }

    /// Outward view. Registry entries have no local process.
    pub fn to_service_record(&self) -> ServiceRecord {
        ServiceRecord {
            id: self.id.to_string(),
            name: self.name.clone(),
            aliases: self.aliases.clone(),
            address: Some(self.address.clone()),
            status: self.state.to_string(),
            state_updated: Some(self.state_updated),
            pid: -1,
            start_time: Some(self.added),
            fail_time: None,
            restart_count: 0,
            fail_count: 0,
            errors: Vec::new(),
            mode: self.mode,
        }
    }
}

/// Random alphanumeric token, fresh for every registration.
pub fn new_fingerprint() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(FINGERPRINT_LEN)
        .map(char::from)
        .collect()
}
