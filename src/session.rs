//! Session registry (spec §4.3): the connected-client side of the store,
//! covering transport attachment, auth/creator metadata, and outbound
//! event delivery.

use std::sync::Arc;

use tracing::instrument;

use crate::entity_store::rows::Auth;
use crate::env::Env;
use crate::error::{SocketError, StoreError};
use crate::ids::{AppId, SessionId};
use crate::Store;

impl<E: Env> Store<E> {
    /// Upsert a session's socket; overwrites any prior value.
    #[instrument(level = "debug", skip(self, socket))]
    pub fn add_socket(&self, session_id: SessionId, socket: Arc<E::Socket>) -> Result<(), StoreError> {
        self.transact("add_socket", |_before, stage| {
            stage.add_socket(session_id, socket);
            Ok(())
        })
        .map(|(.., r)| r)
    }

    #[instrument(level = "debug", skip(self))]
    pub fn set_auth(&self, session_id: SessionId, auth: Auth) -> Result<(), StoreError> {
        self.transact("set_auth", |_before, stage| {
            stage.set_auth(session_id, auth);
            Ok(())
        })
        .map(|(.., r)| r)
    }

    #[instrument(level = "debug", skip(self))]
    pub fn set_creator(&self, session_id: SessionId, creator: serde_json::Value) -> Result<(), StoreError> {
        self.transact("set_creator", |_before, stage| {
            stage.set_creator(session_id, creator);
            Ok(())
        })
        .map(|(.., r)| r)
    }

    #[instrument(level = "debug", skip(self))]
    pub fn set_session_props(
        &self,
        session_id: SessionId,
        auth: Option<Auth>,
        creator: Option<serde_json::Value>,
        versions: Option<std::collections::HashMap<String, String>>,
    ) -> Result<(), StoreError> {
        self.transact("set_session_props", |_before, stage| {
            stage.set_session_props(session_id, auth, creator, versions);
            Ok(())
        })
        .map(|(.., r)| r)
    }

    /// Datalog evaluator's request-coalescing loader handle for a session.
    #[instrument(level = "debug", skip(self, loader))]
    pub fn upsert_datalog_loader(&self, session_id: SessionId, loader: E::Loader) -> Result<(), StoreError> {
        self.transact("upsert_datalog_loader", |_before, stage| {
            stage.upsert_datalog_loader(session_id, loader);
            Ok(())
        })
        .map(|(.., r)| r)
    }

    /// Atomic cascade: retract the session, its InstaqlQueries, its
    /// Subscriptions, then sweep orphan DatalogQueries. No-op if the
    /// session does not exist.
    #[instrument(level = "debug", skip(self))]
    pub fn remove_session(&self, session_id: SessionId) -> Result<(), StoreError> {
        self.transact("remove_session", |_before, stage| {
            stage.remove_session(session_id);
            Ok(())
        })
        .map(|(.., r)| r)
    }

    /// Resolve the session's socket and write a JSON frame. Fails with
    /// `SocketError::Missing` if no socket is attached, `SocketError::Send`
    /// on transport failure.
    #[instrument(level = "debug", skip(self, _app_id, event))]
    pub fn send_event(&self, _app_id: AppId, session_id: SessionId, event: &serde_json::Value) -> Result<(), SocketError> {
        let db = self.snapshot();
        let socket = db
            .session(session_id)
            .and_then(|row| row.socket.clone())
            .ok_or(SocketError::Missing(session_id))?;
        crate::env::SocketSink::send(socket.as_ref(), event).map_err(|e| SocketError::Send(session_id, e))
    }

    /// Same as `send_event` but swallows (and logs) the error rather than
    /// propagating it.
    #[instrument(level = "debug", skip(self, app_id, event))]
    pub fn try_send_event(&self, app_id: AppId, session_id: SessionId, event: &serde_json::Value) {
        if let Err(err) = self.send_event(app_id, session_id, event) {
            tracing::warn!(%session_id, error = %err, "try_send_event: delivery failed, swallowing");
        }
    }
}
