//! The store is generic over the opaque handles its collaborators own: the
//! transport socket (§4.3), and the datalog evaluator's lazy-call and
//! request-coalescing loader handles (§4.5). The store never inspects or
//! awaits these values — it only stores and returns them — so it is
//! parameterized over their concrete types rather than assuming one,
//! mirroring `ankurah-core::reactor::Reactor<E, Ev>`'s genericity over the
//! entity/event types it notifies about.

/// A connected client's writable transport connection. Mirrors
/// `ankurah-core::connector::PeerSender`, but synchronous: the store's
/// concurrency model (spec §5) is parallel blocking threads behind a single
/// write lock, not an async runtime, so `send_event` performs this call
/// inline while holding no store lock.
pub trait SocketSink: Send + Sync {
    fn send(&self, event: &serde_json::Value) -> Result<(), anyhow::Error>;
}

/// The set of collaborator-owned types a `Store` instance is parameterized
/// over.
pub trait Env: Send + Sync + 'static {
    /// A handle to a connected client's writable transport connection.
    type Socket: SocketSink + Send + Sync + 'static;
    /// The datalog evaluator's lazy, single-flight result holder. Cloning a
    /// `Delay` must be cheap (callers typically wrap an `Arc`/`oneshot`
    /// receiver of their own).
    type Delay: Clone + Send + Sync + 'static;
    /// The datalog evaluator's request-coalescing loader handle.
    type Loader: Clone + Send + Sync + 'static;
}
