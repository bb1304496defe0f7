//! Merge durable records with live runtime enumeration.
//!
//! The runtime is authoritative for liveness; records supply identity, request and policy.
//! Instances without a record surface as orphans and are never written back.

use crate::config::types::{Mode, Session, SessionStatus};
use crate::runtime::backend::{InstanceInfo, InstanceState};
use crate::session::store::SessionMap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// One row of `list()`
#[derive(Clone, Debug, Serialize)]
pub struct SessionView {
    pub name: String,
    pub status: SessionStatus,
    pub instance: Option<InstanceInfo>,
    pub record: Option<Session>,
}

impl SessionView {
    pub fn mode(&self) -> Option<Mode> {
        self.record.as_ref().map(Session::mode)
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.record.as_ref().map(|r| r.created_at)
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.record.as_ref().map(|r| r.updated_at)
    }

    /// Instance is up and counts against the session cap
    pub fn is_live(&self) -> bool {
        self.instance
            .as_ref()
            .map(|i| i.state.is_live())
            .unwrap_or(false)
    }

    pub fn is_orphan(&self) -> bool {
        self.status == SessionStatus::Orphan
    }
}

/// Status a record should be shown with given what the runtime reports.
pub fn observed_status(recorded: SessionStatus, state: Option<InstanceState>) -> SessionStatus {
    match state {
        Some(state) if state.is_live() => SessionStatus::Running,
        Some(InstanceState::Created) => SessionStatus::Created,
        Some(InstanceState::Exited) | Some(InstanceState::Dead) => match recorded {
            SessionStatus::Stopped => SessionStatus::Stopped,
            _ => SessionStatus::Exited,
        },
        Some(InstanceState::Removing) => SessionStatus::Removed,
        Some(_) => recorded,
        // Launch still in flight
        None if recorded == SessionStatus::Created => SessionStatus::Created,
        None => SessionStatus::Removed,
    }
}

/// Pure merge, sorted by name.
pub fn reconcile(live: &[InstanceInfo], records: &SessionMap) -> Vec<SessionView> {
    let mut instances: BTreeMap<&str, &InstanceInfo> = BTreeMap::new();
    for info in live {
        instances.insert(info.session_name(), info);
    }

    let mut views: BTreeMap<String, SessionView> = BTreeMap::new();

    for (name, record) in records {
        let instance = instances.remove(name.as_str());
        views.insert(
            name.clone(),
            SessionView {
                name: name.clone(),
                status: observed_status(record.status, instance.map(|i| i.state)),
                instance: instance.cloned(),
                record: Some(record.clone()),
            },
        );
    }

    for (name, info) in instances {
        log::debug!("Managed instance {} has no record, reporting as orphan", name);
        views.insert(
            name.to_string(),
            SessionView {
                name: name.to_string(),
                status: SessionStatus::Orphan,
                instance: Some(info.clone()),
                record: None,
            },
        );
    }

    views.into_values().collect()
}
