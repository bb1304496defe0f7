//! Session registry: the only writer of durable session state.

use crate::config::policy::SandboxPolicy;
use crate::config::settings::Config;
use crate::config::types::{
    Result, SandboxError, SandboxRequest, Session, SessionStatus, ValidationError,
};
use crate::runtime::backend::ContainerRuntime;
use crate::session::names::validate_name;
use crate::session::reconcile::{reconcile, SessionView};
use crate::session::store::{SessionMap, SessionStore};
use chrono::Utc;
use std::sync::Arc;

pub struct SessionRegistry {
    store: SessionStore,
    runtime: Arc<dyn ContainerRuntime>,
}

impl SessionRegistry {
    pub fn new(config: &Config, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            store: SessionStore::new(config.sessions_file()),
            runtime,
        }
    }

    /// Record a new session in `created`. A non-removed record with the same name is a
    /// duplicate.
    pub fn create(
        &self,
        name: &str,
        request: &SandboxRequest,
        policy: &SandboxPolicy,
    ) -> Result<Session> {
        if let Err(reason) = validate_name(name) {
            let mut error = ValidationError::new();
            error.push("name", reason);
            return Err(error.into());
        }

        let session = self.store.update(|sessions| {
            if let Some(existing) = sessions.get(name) {
                if existing.status != SessionStatus::Removed {
                    return Err(SandboxError::DuplicateSession {
                        name: name.to_string(),
                        status: existing.status,
                    });
                }
            }

            let now = Utc::now();
            let session = Session {
                name: name.to_string(),
                request: request.clone(),
                policy: policy.clone(),
                status: SessionStatus::Created,
                created_at: now,
                updated_at: now,
                runtime_ref: None,
            };
            sessions.insert(name.to_string(), session.clone());
            Ok(session)
        })?;

        log::info!("Registered session {} ({})", name, request.mode);
        Ok(session)
    }

    /// Total: unknown names and repeated statuses are no-ops, backward moves are ignored.
    pub fn set_status(&self, name: &str, status: SessionStatus) -> Result<()> {
        self.store.update(|sessions| {
            let Some(session) = sessions.get_mut(name) else {
                log::debug!("set_status({}, {}): no record, ignoring", name, status);
                return Ok(());
            };

            if session.status == status {
                return Ok(());
            }
            if !session.status.can_transition_to(status) {
                log::warn!(
                    "Ignoring backward transition for {}: {} -> {}",
                    name,
                    session.status,
                    status
                );
                return Ok(());
            }

            log::debug!("Session {}: {} -> {}", name, session.status, status);
            session.status = status;
            session.updated_at = Utc::now();
            Ok(())
        })
    }

    pub fn set_runtime_ref(&self, name: &str, runtime_ref: &str) -> Result<()> {
        self.store.update(|sessions| {
            if let Some(session) = sessions.get_mut(name) {
                session.runtime_ref = Some(runtime_ref.to_string());
                session.updated_at = Utc::now();
            }
            Ok(())
        })
    }

    pub fn get(&self, name: &str) -> Result<Option<Session>> {
        Ok(self.store.load()?.remove(name))
    }

    /// Durable records only, without consulting the runtime
    pub fn records(&self) -> Result<SessionMap> {
        self.store.load()
    }

    /// Records reconciled against live instances. Read-only.
    pub fn list(&self) -> Result<Vec<SessionView>> {
        let live = self.runtime.list_instances()?;
        let records = self.store.load()?;
        Ok(reconcile(&live, &records))
    }

    /// Latest-created running session; ties go to the most recently updated record.
    pub fn most_recent(&self) -> Result<Option<SessionView>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|view| view.status == SessionStatus::Running && view.record.is_some())
            .max_by_key(|view| (view.created_at(), view.updated_at())))
    }

    /// Delete metadata only. Never touches the instance. Returns whether a record existed.
    pub fn remove(&self, name: &str) -> Result<bool> {
        let removed = self
            .store
            .update(|sessions| Ok(sessions.remove(name).is_some()))?;
        if removed {
            log::info!("Removed registry record for {}", name);
        }
        Ok(removed)
    }
}
