//! Index of live negotiation sessions.
//!
//! The registry is the only place sessions are created or removed. Each
//! session task removes its own entry, through the registry's index, when it
//! reaches a terminal state.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    entity::{Candidate, Role, SessionDescription, SessionId},
    error::RelayError,
    session::{Session, SessionHandle, SessionOptions, SessionState, SessionStatus},
};

type Index = HashMap<SessionId, SessionHandle>;

#[derive(Clone)]
pub struct Registry {
    sessions: Arc<Mutex<Index>>,
    options: SessionOptions,
    /// Parent of every session token.
    root: CancellationToken,
}

fn lock(sessions: &Mutex<Index>) -> MutexGuard<'_, Index> {
    sessions.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Registry {
    pub fn new(options: SessionOptions) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            options,
            root: CancellationToken::new(),
        }
    }

    /// Start a session from its first description. An initiator description
    /// opens it in `OfferReceived`, a responder one in `AwaitingOffer`.
    pub fn create_session(&self, description: SessionDescription) -> SessionId {
        let role = description.role;
        let (handle, session) = Session::new(description, self.options, self.root.child_token());
        let id = handle.id();
        lock(&self.sessions).insert(id, handle);

        let sessions = Arc::clone(&self.sessions);
        tokio::spawn(async move {
            let state = session.run().await;
            lock(&sessions).remove(&id);
            debug!(session = %id, %state, "session removed");
        });
        info!(session = %id, %role, "session created");
        id
    }

    pub async fn submit_description(
        &self,
        id: SessionId,
        description: SessionDescription,
    ) -> crate::Result<SessionState> {
        self.session(id)?.submit_description(description).await
    }

    pub async fn dispatch(&self, id: SessionId) -> crate::Result<SessionDescription> {
        self.session(id)?.dispatch().await
    }

    pub async fn await_description(
        &self,
        id: SessionId,
        role: Role,
    ) -> crate::Result<SessionDescription> {
        self.session(id)?.await_description(role).await
    }

    pub async fn submit_candidate(&self, candidate: Candidate) -> crate::Result<()> {
        self.session(candidate.session_id)?
            .submit_candidate(candidate)
            .await
    }

    pub async fn complete_candidates(&self, id: SessionId, role: Role) -> crate::Result<()> {
        self.session(id)?.complete_candidates(role).await
    }

    pub async fn attach(
        &self,
        id: SessionId,
        role: Role,
    ) -> crate::Result<mpsc::Receiver<Candidate>> {
        self.session(id)?.attach(role).await
    }

    pub async fn status(&self, id: SessionId) -> crate::Result<SessionStatus> {
        self.session(id)?.status().await
    }

    /// Remove the session and stop it: `Closed` if it was connected,
    /// `Cancelled` otherwise.
    pub async fn retire(&self, id: SessionId) -> crate::Result<SessionState> {
        let handle = lock(&self.sessions)
            .remove(&id)
            .ok_or(RelayError::SessionNotFound(id))?;
        info!(session = %id, "retiring session");
        match handle.close().await {
            Err(RelayError::SessionClosed(_)) => Ok(SessionState::Closed),
            Err(RelayError::Cancelled(_)) => Ok(SessionState::Cancelled),
            other => other,
        }
    }

    /// Cancel every session, current and future.
    pub fn shutdown(&self) {
        info!(live = self.len(), "cancelling sessions");
        self.root.cancel();
    }

    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn session(&self, id: SessionId) -> crate::Result<SessionHandle> {
        lock(&self.sessions)
            .get(&id)
            .cloned()
            .ok_or(RelayError::SessionNotFound(id))
    }
}
