pub mod datalog_cache;
pub mod entity_store;
pub mod env;
pub mod error;
pub mod ids;
pub mod invalidator;
pub mod session;
pub mod subscription_graph;
pub mod topic;
pub mod value;

pub use entity_store::{Db, Store};
pub use env::{Env, SocketSink};
pub use error::{SocketError, StoreError};
pub use subscription_graph::AddInstaqlQueryOutcome;
