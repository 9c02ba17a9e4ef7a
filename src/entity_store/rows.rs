//! Row shapes for the five entity kinds the store indexes (spec §3).

use std::collections::HashMap;
use std::sync::Arc;

use crate::ids::{AppId, Eid, QueryKey, SessionId};
use crate::topic::Topic;

/// `InstaqlQuery.return_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnType {
    JoinRows,
    Tree,
}

/// `Session.auth`.
#[derive(Debug, Clone)]
pub struct Auth {
    pub app: AppId,
    pub user: serde_json::Value,
    pub admin: bool,
}

/// The socket is held behind an `Arc` regardless of whether the concrete
/// `Env::Socket` is cheaply cloneable, so that the entity store's
/// clone-on-write snapshotting (see `entity_store::DbInner`) never needs to
/// duplicate the underlying transport handle itself.
pub struct SessionRow<Soc, Loader> {
    pub socket: Option<Arc<Soc>>,
    pub auth: Option<Auth>,
    pub creator: Option<serde_json::Value>,
    pub versions: HashMap<String, String>,
    pub datalog_loader: Option<Loader>,
}

impl<Soc, Loader> Clone for SessionRow<Soc, Loader>
where Loader: Clone
{
    fn clone(&self) -> Self {
        Self {
            socket: self.socket.clone(),
            auth: self.auth.clone(),
            creator: self.creator.clone(),
            versions: self.versions.clone(),
            datalog_loader: self.datalog_loader.clone(),
        }
    }
}

impl<Soc, Loader> Default for SessionRow<Soc, Loader> {
    fn default() -> Self { Self { socket: None, auth: None, creator: None, versions: HashMap::new(), datalog_loader: None } }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TxMetaRow {
    pub processed_tx_id: u64,
}

#[derive(Debug, Clone)]
pub struct InstaqlRow {
    pub session_id: SessionId,
    pub query: serde_json::Value,
    pub stale: bool,
    pub version: u32,
    pub hash: Option<String>,
    pub return_type: ReturnType,
}

#[derive(Clone)]
pub struct DatalogRow<Delay> {
    pub app_id: AppId,
    pub query: serde_json::Value,
    pub delayed_call: Option<Delay>,
    pub topics: Vec<Topic>,
}

#[derive(Debug, Clone)]
pub struct SubscriptionRow {
    pub app_id: AppId,
    pub session_id: SessionId,
    pub instaql_query: serde_json::Value,
    pub instaql_query_key: QueryKey,
    pub datalog_query: Eid,
    pub v: u32,
}
