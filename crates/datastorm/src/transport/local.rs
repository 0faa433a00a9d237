// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process transport.
//!
//! A [`LocalNetwork`] hosts any number of adapters ([`LocalTransport`]), each
//! with an optional endpoint name and one dispatch thread. Requests queued to
//! an adapter are dispatched in FIFO order, which gives the per-connection
//! ordering a stream transport provides.
//!
//! ```text
//!  adapter "a"                          adapter "b"
//!  +------------+   LocalConnection    +------------+
//!  | servants   |<====================>| servants   |
//!  | queue ---> |  (one per pair,      | queue ---> |
//!  | worker     |   bidirectional)     | worker     |
//!  +------------+                      +------------+
//! ```

use super::{
    Connection, ConnectionId, Current, Dispatcher, Identity, Proxy, Reply, ReplyCallback,
    Responder, Transport, TransportError,
};
use crate::protocol::Request;
use crossbeam::channel::{self, Sender};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{JoinHandle, ThreadId};

type Task = Box<dyn FnOnce() + Send>;
type CloseCallback = Box<dyn FnOnce(TransportError) + Send>;

/// In-process network of adapters.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    inner: Arc<NetworkInner>,
}

#[derive(Default)]
struct NetworkInner {
    endpoints: Mutex<HashMap<String, Weak<Adapter>>>,
    multicast: Mutex<Vec<(Weak<Adapter>, Identity)>>,
    /// Serializes link creation between two adapters.
    links: Mutex<()>,
    next_id: AtomicU64,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an adapter. With an endpoint, other adapters can dial it.
    pub fn adapter(&self, endpoint: Option<&str>) -> Result<Arc<LocalTransport>, TransportError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = channel::unbounded::<Task>();
        let adapter = Arc::new(Adapter {
            id,
            endpoint: endpoint.map(str::to_string),
            network: Arc::downgrade(&self.inner),
            servants: RwLock::new(HashMap::new()),
            categories: RwLock::new(HashMap::new()),
            queue: Mutex::new(Some(tx)),
            links: Mutex::new(HashMap::new()),
            destroyed: AtomicBool::new(false),
        });

        if let Some(endpoint) = endpoint {
            let mut endpoints = self.inner.endpoints.lock();
            if endpoints
                .get(endpoint)
                .is_some_and(|existing| existing.upgrade().is_some())
            {
                return Err(TransportError::Protocol(format!(
                    "endpoint `{}` already in use",
                    endpoint
                )));
            }
            endpoints.insert(endpoint.to_string(), Arc::downgrade(&adapter));
        }

        let name = endpoint.map_or_else(|| format!("ds-local-{}", id), |e| format!("ds-local-{}", e));
        let worker = std::thread::Builder::new()
            .name(name)
            .spawn(move || {
                while let Ok(task) = rx.recv() {
                    task();
                }
            })
            .map_err(|e| TransportError::Protocol(format!("failed to spawn dispatch thread: {}", e)))?;

        log::debug!("[LOCAL] adapter {} created (endpoint={:?})", id, endpoint);
        Ok(Arc::new(LocalTransport {
            worker_id: worker.thread().id(),
            adapter,
            worker: Mutex::new(Some(worker)),
        }))
    }

    fn lookup(&self, endpoint: &str) -> Option<Arc<Adapter>> {
        self.inner.endpoints.lock().get(endpoint).and_then(Weak::upgrade)
    }
}

struct Adapter {
    id: u64,
    endpoint: Option<String>,
    network: Weak<NetworkInner>,
    servants: RwLock<HashMap<Identity, Arc<dyn Dispatcher>>>,
    categories: RwLock<HashMap<String, Arc<dyn Dispatcher>>>,
    queue: Mutex<Option<Sender<Task>>>,
    /// Our half of the connection to each peer adapter, by peer adapter id.
    links: Mutex<HashMap<u64, Arc<LocalConnection>>>,
    destroyed: AtomicBool,
}

impl Adapter {
    fn post(&self, task: Task) -> bool {
        // Refused tasks must drop outside the queue lock.
        let sender = self.queue.lock().clone();
        match sender {
            Some(tx) => tx.send(task).is_ok(),
            None => false,
        }
    }

    fn find(&self, identity: &Identity) -> Option<Arc<dyn Dispatcher>> {
        if let Some(servant) = self.servants.read().get(identity) {
            return Some(servant.clone());
        }
        self.categories.read().get(&identity.category).cloned()
    }

    /// Queue `request` for dispatch on this adapter.
    fn deliver(self: &Arc<Self>, current: Current, request: Request, responder: Responder) {
        let adapter = self.clone();
        let task: Task = Box::new(move || match adapter.find(&current.identity) {
            Some(dispatcher) => dispatcher.dispatch(current, request, responder),
            None => {
                log::trace!("[LOCAL] no servant for {}", current.identity);
                responder.respond(Err(TransportError::ObjectNotExist(
                    current.identity.to_string(),
                )));
            }
        });
        // A refused task drops its responder, which fails two-way requests.
        let _ = self.post(task);
    }
}

struct Link {
    id: ConnectionId,
    closed: AtomicBool,
}

/// One side of a connection between two adapters.
pub struct LocalConnection {
    link: Arc<Link>,
    local: Weak<Adapter>,
    remote: Weak<Adapter>,
    peer: Mutex<Weak<LocalConnection>>,
    callbacks: Mutex<Vec<CloseCallback>>,
}

impl LocalConnection {
    fn peer(&self) -> Option<Arc<LocalConnection>> {
        self.peer.lock().upgrade()
    }

    fn fire_close(&self) {
        let callbacks = std::mem::take(&mut *self.callbacks.lock());
        if let Some(local) = self.local.upgrade() {
            local.links.lock().retain(|_, c| c.link.id != self.link.id);
            for callback in callbacks {
                local.post(Box::new(move || callback(TransportError::ConnectionLost)));
            }
        }
    }
}

impl fmt::Debug for LocalConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalConnection")
            .field("id", &self.link.id)
            .field("closed", &self.link.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl Connection for LocalConnection {
    fn id(&self) -> ConnectionId {
        self.link.id
    }

    fn on_close(&self, callback: CloseCallback) {
        if self.is_closed() {
            if let Some(local) = self.local.upgrade() {
                local.post(Box::new(move || callback(TransportError::ConnectionLost)));
            }
            return;
        }
        self.callbacks.lock().push(callback);
        // Lost the race with close(): fire_close() may already have drained.
        if self.is_closed() {
            self.fire_close();
        }
    }

    fn close(&self) {
        if self.link.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        log::debug!("[LOCAL] connection {} closed", self.link.id);
        self.fire_close();
        if let Some(peer) = self.peer() {
            peer.fire_close();
        }
    }

    fn is_closed(&self) -> bool {
        self.link.closed.load(Ordering::Acquire)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Adapter handle implementing [`Transport`].
pub struct LocalTransport {
    adapter: Arc<Adapter>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl LocalTransport {
    fn network(&self) -> Result<Arc<NetworkInner>, TransportError> {
        self.adapter
            .network
            .upgrade()
            .ok_or(TransportError::CommunicatorDestroyed)
    }

    /// Close every connection of this adapter (failure injection).
    pub fn close_connections(&self) {
        let links: Vec<_> = self.adapter.links.lock().values().cloned().collect();
        for link in links {
            link.close();
        }
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.adapter.links.lock().len()
    }

    fn link_to(&self, remote: &Arc<Adapter>) -> Result<Arc<LocalConnection>, TransportError> {
        if remote.destroyed.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionRefused(
                remote.endpoint.clone().unwrap_or_default(),
            ));
        }
        let network = self.network()?;
        let _guard = network.links.lock();
        if let Some(existing) = self.adapter.links.lock().get(&remote.id) {
            if !existing.is_closed() {
                return Ok(existing.clone());
            }
        }

        let link = Arc::new(Link {
            id: network.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            closed: AtomicBool::new(false),
        });
        let ours = Arc::new(LocalConnection {
            link: link.clone(),
            local: Arc::downgrade(&self.adapter),
            remote: Arc::downgrade(remote),
            peer: Mutex::new(Weak::new()),
            callbacks: Mutex::new(Vec::new()),
        });
        let theirs = Arc::new(LocalConnection {
            link,
            local: Arc::downgrade(remote),
            remote: Arc::downgrade(&self.adapter),
            peer: Mutex::new(Arc::downgrade(&ours)),
            callbacks: Mutex::new(Vec::new()),
        });
        *ours.peer.lock() = Arc::downgrade(&theirs);

        self.adapter.links.lock().insert(remote.id, ours.clone());
        remote.links.lock().insert(self.adapter.id, theirs);
        log::debug!(
            "[LOCAL] connection {} established {} -> {}",
            ours.link.id,
            self.adapter.id,
            remote.id
        );
        Ok(ours)
    }

    /// Resolve the local half of the connection and the peer's half.
    fn route(
        &self,
        target: &Proxy,
    ) -> Result<(Arc<LocalConnection>, Arc<LocalConnection>, Arc<Adapter>), TransportError> {
        if self.adapter.destroyed.load(Ordering::Acquire) {
            return Err(TransportError::CommunicatorDestroyed);
        }

        let ours = if let Some(connection) = &target.connection {
            let local = connection
                .as_any()
                .downcast_ref::<LocalConnection>()
                .ok_or_else(|| TransportError::Protocol("foreign connection".into()))?;
            if local.is_closed() {
                return Err(TransportError::ConnectionLost);
            }
            let remote = local.remote.upgrade().ok_or(TransportError::ConnectionLost)?;
            self.adapter
                .links
                .lock()
                .get(&remote.id)
                .filter(|c| c.link.id == local.link.id)
                .cloned()
                .ok_or(TransportError::ConnectionLost)?
        } else if let Some(endpoint) = &target.endpoint {
            let remote = LocalNetwork {
                inner: self.network()?,
            }
            .lookup(endpoint)
            .ok_or_else(|| TransportError::ConnectionRefused(endpoint.clone()))?;
            self.link_to(&remote)?
        } else {
            return Err(TransportError::Protocol(format!(
                "proxy {} has no endpoint or connection",
                target.identity
            )));
        };

        let theirs = ours.peer().ok_or(TransportError::ConnectionLost)?;
        let remote = ours.remote.upgrade().ok_or(TransportError::ConnectionLost)?;
        Ok((ours, theirs, remote))
    }

    fn current_for(target: &Proxy, connection: Arc<LocalConnection>) -> Current {
        Current {
            identity: target.identity.clone(),
            facet: target.facet.clone(),
            connection: Some(connection as Arc<dyn Connection>),
        }
    }
}

impl Transport for LocalTransport {
    fn endpoint(&self) -> Option<String> {
        self.adapter.endpoint.clone()
    }

    fn send(&self, target: &Proxy, request: Request) -> Result<(), TransportError> {
        let (_, theirs, remote) = self.route(target)?;
        remote.deliver(Self::current_for(target, theirs), request, Responder::oneway());
        Ok(())
    }

    fn invoke(&self, target: &Proxy, request: Request, reply: ReplyCallback) {
        let caller = self.adapter.clone();
        match self.route(target) {
            Ok((_, theirs, remote)) => {
                let responder = Responder::new(Box::new(move |result: Reply| {
                    caller.post(Box::new(move || reply(result)));
                }));
                remote.deliver(Self::current_for(target, theirs), request, responder);
            }
            Err(e) => {
                caller.post(Box::new(move || reply(Err(e))));
            }
        }
    }

    fn connect(&self, target: &Proxy) -> Result<Arc<dyn Connection>, TransportError> {
        let (ours, _, _) = self.route(target)?;
        Ok(ours)
    }

    fn register(&self, identity: Identity, dispatcher: Arc<dyn Dispatcher>) {
        self.adapter.servants.write().insert(identity, dispatcher);
    }

    fn unregister(&self, identity: &Identity) {
        self.adapter.servants.write().remove(identity);
    }

    fn register_category(&self, category: &str, dispatcher: Arc<dyn Dispatcher>) {
        self.adapter
            .categories
            .write()
            .insert(category.to_string(), dispatcher);
    }

    fn unregister_category(&self, category: &str) {
        self.adapter.categories.write().remove(category);
    }

    fn join_multicast(&self, identity: Identity) -> Result<(), TransportError> {
        self.network()?
            .multicast
            .lock()
            .push((Arc::downgrade(&self.adapter), identity));
        Ok(())
    }

    fn multicast(&self, request: Request) -> Result<(), TransportError> {
        let members: Vec<(Arc<Adapter>, Identity)> = self
            .network()?
            .multicast
            .lock()
            .iter()
            .filter_map(|(adapter, identity)| adapter.upgrade().map(|a| (a, identity.clone())))
            .filter(|(adapter, _)| adapter.id != self.adapter.id)
            .collect();
        for (adapter, identity) in members {
            let current = Current {
                identity,
                facet: String::new(),
                connection: None,
            };
            adapter.deliver(current, request.clone(), Responder::oneway());
        }
        Ok(())
    }

    fn shutdown(&self) {
        if self.adapter.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(network) = self.adapter.network.upgrade() {
            if let Some(endpoint) = &self.adapter.endpoint {
                network.endpoints.lock().remove(endpoint);
            }
            network
                .multicast
                .lock()
                .retain(|(adapter, _)| !std::ptr::eq(adapter.as_ptr(), Arc::as_ptr(&self.adapter)));
        }
        self.close_connections();
        self.adapter.servants.write().clear();
        self.adapter.categories.write().clear();

        // Stop the worker once the queue drains.
        let sender = self.adapter.queue.lock().take();
        drop(sender);
        if std::thread::current().id() != self.worker_id {
            if let Some(worker) = self.worker.lock().take() {
                let _ = worker.join();
            }
        }
        log::debug!("[LOCAL] adapter {} shut down", self.adapter.id);
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{NodeRef, Response, SessionRequest};
    use std::sync::mpsc;
    use std::time::Duration;

    struct Echo {
        seen: Mutex<Vec<String>>,
    }

    impl Dispatcher for Echo {
        fn dispatch(&self, current: Current, request: Request, responder: Responder) {
            let label = match &request {
                Request::Session(r) => r.name().to_string(),
                Request::Lookup(_) => "lookup".to_string(),
                Request::Node(_) => "node".to_string(),
            };
            self.seen.lock().push(format!("{}:{}", current.facet, label));
            responder.respond(Ok(Response::Node(NodeRef::new("echo", None))));
        }
    }

    fn echo() -> Arc<Echo> {
        Arc::new(Echo {
            seen: Mutex::new(Vec::new()),
        })
    }

    #[test]
    fn test_invoke_round_trip() {
        let network = LocalNetwork::new();
        let a = network.adapter(None).expect("adapter a");
        let b = network.adapter(Some("b")).expect("adapter b");
        let servant = echo();
        b.register(Identity::new("x", "y"), servant.clone());

        let (tx, rx) = mpsc::channel();
        let proxy = Proxy::direct(Identity::new("x", "y"), "b").with_facet("f");
        a.invoke(
            &proxy,
            Request::Session(SessionRequest::Disconnected),
            Box::new(move |reply| {
                let _ = tx.send(reply);
            }),
        );

        let reply = rx.recv_timeout(Duration::from_secs(5)).expect("reply");
        assert_eq!(reply, Ok(Response::Node(NodeRef::new("echo", None))));
        assert_eq!(servant.seen.lock().as_slice(), ["f:disconnected"]);
        assert_eq!(a.connection_count(), 1);
        assert_eq!(b.connection_count(), 1);
    }

    #[test]
    fn test_unknown_endpoint_refused() {
        let network = LocalNetwork::new();
        let a = network.adapter(None).expect("adapter a");
        let proxy = Proxy::direct(Identity::new("x", "y"), "nowhere");

        let err = a
            .send(&proxy, Request::Session(SessionRequest::Disconnected))
            .expect_err("must fail");
        assert_eq!(err, TransportError::ConnectionRefused("nowhere".into()));
    }

    #[test]
    fn test_missing_servant_fails_invocation() {
        let network = LocalNetwork::new();
        let a = network.adapter(None).expect("adapter a");
        let _b = network.adapter(Some("b")).expect("adapter b");

        let (tx, rx) = mpsc::channel();
        a.invoke(
            &Proxy::direct(Identity::new("x", "missing"), "b"),
            Request::Session(SessionRequest::Disconnected),
            Box::new(move |reply| {
                let _ = tx.send(reply);
            }),
        );
        let reply = rx.recv_timeout(Duration::from_secs(5)).expect("reply");
        assert!(matches!(reply, Err(TransportError::ObjectNotExist(_))));
    }

    #[test]
    fn test_fixed_proxy_reaches_dialer() {
        let network = LocalNetwork::new();
        let a = network.adapter(None).expect("adapter a");
        let b = network.adapter(Some("b")).expect("adapter b");
        let servant = echo();
        a.register(Identity::new("x", "back"), servant.clone());

        let connection = a
            .connect(&Proxy::direct(Identity::new("x", "y"), "b"))
            .expect("connect");
        let peer_side = b.adapter.links.lock().values().next().cloned().expect("link");
        assert_eq!(peer_side.id(), connection.id());

        let back = Proxy::fixed(Identity::new("x", "back"), peer_side);
        b.send(&back, Request::Session(SessionRequest::Disconnected))
            .expect("send back");

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while servant.seen.lock().is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(servant.seen.lock().len(), 1);
    }

    #[test]
    fn test_close_notifies_both_sides() {
        let network = LocalNetwork::new();
        let a = network.adapter(None).expect("adapter a");
        let b = network.adapter(Some("b")).expect("adapter b");

        let connection = a
            .connect(&Proxy::direct(Identity::new("x", "y"), "b"))
            .expect("connect");
        let peer_side = b.adapter.links.lock().values().next().cloned().expect("link");

        let (tx, rx) = mpsc::channel();
        let tx2 = tx.clone();
        connection.on_close(Box::new(move |_| {
            let _ = tx.send("a");
        }));
        peer_side.on_close(Box::new(move |_| {
            let _ = tx2.send("b");
        }));

        a.close_connections();

        let mut sides = vec![
            rx.recv_timeout(Duration::from_secs(5)).expect("first"),
            rx.recv_timeout(Duration::from_secs(5)).expect("second"),
        ];
        sides.sort_unstable();
        assert_eq!(sides, ["a", "b"]);
        assert!(connection.is_closed());
        assert_eq!(a.connection_count(), 0);
        assert_eq!(b.connection_count(), 0);

        let err = a
            .send(
                &Proxy::fixed(Identity::new("x", "y"), connection),
                Request::Session(SessionRequest::Disconnected),
            )
            .expect_err("closed");
        assert_eq!(err, TransportError::ConnectionLost);
    }

    #[test]
    fn test_multicast_skips_sender() {
        let network = LocalNetwork::new();
        let a = network.adapter(None).expect("adapter a");
        let b = network.adapter(None).expect("adapter b");
        let sa = echo();
        let sb = echo();
        a.register(Identity::new("lookup", "a"), sa.clone());
        b.register(Identity::new("lookup", "b"), sb.clone());
        a.join_multicast(Identity::new("lookup", "a")).expect("join a");
        b.join_multicast(Identity::new("lookup", "b")).expect("join b");

        a.multicast(Request::Session(SessionRequest::Disconnected))
            .expect("multicast");

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while sb.seen.lock().is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(sb.seen.lock().len(), 1);
        assert!(sa.seen.lock().is_empty());
    }

    #[test]
    fn test_duplicate_endpoint_rejected() {
        let network = LocalNetwork::new();
        let _a = network.adapter(Some("same")).expect("first");
        assert!(network.adapter(Some("same")).is_err());
    }
}
