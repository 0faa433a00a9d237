// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Node sessions and the lookup servant.

use super::Forwarder;
use crate::api::Result;
use crate::config::{FORWARDER_CATEGORY, LOOKUP_CATEGORY, LOOKUP_NAME};
use crate::core::element::ElementKind;
use crate::core::instance::Instance;
use crate::protocol::{LookupRequest, NodeRef, Request, Response};
use crate::transport::{
    Connection, ConnectionId, Current, Dispatcher, Identity, Proxy, Reply, Responder,
    TransportError,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

pub(crate) fn lookup_identity() -> Identity {
    Identity::new(LOOKUP_CATEGORY, LOOKUP_NAME)
}

/// Discovery link with one peer node.
struct NodeSession {
    connection: Arc<dyn Connection>,
    /// Peer lookup servant over `connection`.
    lookup: Proxy,
    /// Accepted from the peer (we relay for it) rather than dialed.
    inbound: bool,
    /// Configured endpoint for dialed sessions.
    endpoint: Option<String>,
}

#[derive(Default)]
struct ManagerState {
    sessions: HashMap<String, NodeSession>,
    /// Reconnection attempts per configured endpoint.
    attempts: HashMap<String, u32>,
    multicast: bool,
    stopped: bool,
}

pub(crate) struct NodeSessionManager {
    instance: Weak<Instance>,
    pub(crate) forwarder: Arc<Forwarder>,
    state: Mutex<ManagerState>,
}

impl NodeSessionManager {
    pub(crate) fn new(instance: Weak<Instance>) -> Self {
        Self {
            forwarder: Arc::new(Forwarder::new(instance.clone())),
            instance,
            state: Mutex::new(ManagerState::default()),
        }
    }

    /// Register the lookup and forwarder servants, join multicast and dial
    /// the configured peers.
    pub(crate) fn start(&self, connect_to: &[String], multicast: bool) -> Result<()> {
        let Some(instance) = self.instance.upgrade() else {
            return Ok(());
        };
        instance.transport.register(
            lookup_identity(),
            Arc::new(LookupServant {
                instance: self.instance.clone(),
            }),
        );
        instance
            .transport
            .register_category(FORWARDER_CATEGORY, self.forwarder.clone());
        if multicast {
            instance.transport.join_multicast(lookup_identity())?;
            self.state.lock().multicast = true;
        }
        for endpoint in connect_to {
            self.connect(endpoint.clone());
        }
        Ok(())
    }

    // ========================================================================
    // Outbound node sessions
    // ========================================================================

    fn connect(&self, endpoint: String) {
        let Some(instance) = self.instance.upgrade() else {
            return;
        };
        if instance.is_shutdown() || self.state.lock().stopped {
            return;
        }
        log::debug!("[DISCOVERY] connecting to {}", endpoint);
        let proxy = Proxy::direct(lookup_identity(), endpoint.clone());
        let target = proxy.clone();
        let weak = self.instance.clone();
        instance.transport.invoke(
            &target,
            Request::Lookup(LookupRequest::CreateSession {
                node: instance.node_ref(),
            }),
            Box::new(move |reply: Reply| {
                let Some(instance) = weak.upgrade() else {
                    return;
                };
                let manager = &instance.discovery;
                match reply {
                    Ok(Response::Node(peer)) => manager.connected_to(endpoint, peer, &proxy),
                    Ok(other) => {
                        log::debug!("[DISCOVERY] unexpected reply from {}: {:?}", endpoint, other);
                        manager.schedule_connect(endpoint);
                    }
                    Err(e) => {
                        log::debug!("[DISCOVERY] connection to {} failed: {}", endpoint, e);
                        manager.schedule_connect(endpoint);
                    }
                }
            }),
        );
    }

    fn schedule_connect(&self, endpoint: String) {
        let Some(instance) = self.instance.upgrade() else {
            return;
        };
        let delay = {
            let mut state = self.state.lock();
            if state.stopped || instance.is_shutdown() {
                return;
            }
            let attempt = state.attempts.entry(endpoint.clone()).or_insert(0);
            let delay = instance.config.retry_policy().delay(*attempt);
            *attempt = attempt.saturating_add(1);
            delay
        };
        let weak = self.instance.clone();
        instance.timer.schedule(delay, move || {
            if let Some(instance) = weak.upgrade() {
                instance.discovery.connect(endpoint);
            }
        });
    }

    fn connected_to(&self, endpoint: String, peer: NodeRef, proxy: &Proxy) {
        let Some(instance) = self.instance.upgrade() else {
            return;
        };
        let connection = match instance.transport.connect(proxy) {
            Ok(connection) => connection,
            Err(e) => {
                log::debug!("[DISCOVERY] lost connection to {}: {}", endpoint, e);
                self.schedule_connect(endpoint);
                return;
            }
        };
        let lookup = Proxy::fixed(lookup_identity(), connection.clone());
        {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            state.attempts.remove(&endpoint);
            state.sessions.insert(
                peer.name.clone(),
                NodeSession {
                    connection: connection.clone(),
                    lookup: lookup.clone(),
                    inbound: false,
                    endpoint: Some(endpoint.clone()),
                },
            );
        }
        self.watch(&peer.name, &connection);
        log::info!("[DISCOVERY] node session with {} ({}) established", peer.name, endpoint);
        self.announce_all(&instance, &lookup);
    }

    fn watch(&self, name: &str, connection: &Arc<dyn Connection>) {
        let weak = self.instance.clone();
        let name = name.to_string();
        let id = connection.id();
        connection.on_close(Box::new(move |_| {
            if let Some(instance) = weak.upgrade() {
                instance.discovery.session_closed(&name, id);
            }
        }));
    }

    fn session_closed(&self, name: &str, connection: ConnectionId) {
        let removed = {
            let mut state = self.state.lock();
            match state.sessions.get(name) {
                Some(session) if session.connection.id() == connection => {
                    state.sessions.remove(name)
                }
                _ => None,
            }
        };
        let Some(session) = removed else {
            return;
        };
        log::info!("[DISCOVERY] node session with {} lost", name);
        self.forwarder.node_lost(name);
        if let Some(endpoint) = session.endpoint {
            self.schedule_connect(endpoint);
        }
    }

    fn announce_all(&self, instance: &Instance, lookup: &Proxy) {
        let request = Request::Lookup(LookupRequest::AnnounceTopics {
            readers: instance.topics.names(ElementKind::Reader),
            writers: instance.topics.names(ElementKind::Writer),
            node: instance.node_ref(),
        });
        if let Err(e) = instance.transport.send(lookup, request) {
            log::debug!("[DISCOVERY] failed to announce topics: {}", e);
        }
    }

    // ========================================================================
    // Announcements
    // ========================================================================

    /// Announce the first local topic of `kind` named `name`.
    pub(crate) fn announce_topic(&self, kind: ElementKind, name: &str) {
        let Some(instance) = self.instance.upgrade() else {
            return;
        };
        let node = instance.node_ref();
        let request = Request::Lookup(match kind {
            ElementKind::Reader => LookupRequest::AnnounceTopicReader {
                name: name.to_string(),
                node,
            },
            ElementKind::Writer => LookupRequest::AnnounceTopicWriter {
                name: name.to_string(),
                node,
            },
        });
        let (lookups, multicast): (Vec<Proxy>, bool) = {
            let state = self.state.lock();
            (
                state.sessions.values().map(|s| s.lookup.clone()).collect(),
                state.multicast,
            )
        };
        for lookup in lookups {
            if let Err(e) = instance.transport.send(&lookup, request.clone()) {
                log::debug!("[DISCOVERY] failed to announce {}: {}", name, e);
            }
        }
        if multicast {
            if let Err(e) = instance.transport.multicast(request) {
                log::debug!("[DISCOVERY] multicast announcement of {} failed: {}", name, e);
            }
        }
    }

    /// Connection to the node session with `name`, if any.
    pub(crate) fn connection_to(&self, name: &str) -> Option<Arc<dyn Connection>> {
        self.state
            .lock()
            .sessions
            .get(name)
            .filter(|s| !s.connection.is_closed())
            .map(|s| s.connection.clone())
    }

    pub(crate) fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Relay an announcement received on `current` to the other node
    /// sessions: from an inbound peer to everyone, from a dialed peer to the
    /// inbound peers only. Multicast announcements are never relayed.
    fn forward(&self, instance: &Instance, current: &Current, mut request: Request, about: &str) {
        let Some(source) = current.connection_id() else {
            return;
        };
        let targets: Vec<Proxy> = {
            let state = self.state.lock();
            let Some(inbound) = state
                .sessions
                .values()
                .find(|s| s.connection.id() == source)
                .map(|s| s.inbound)
            else {
                return;
            };
            state
                .sessions
                .iter()
                .filter(|(name, s)| {
                    s.connection.id() != source && name.as_str() != about && (inbound || s.inbound)
                })
                .map(|(_, s)| s.lookup.clone())
                .collect()
        };
        if targets.is_empty() {
            return;
        }
        let relay = instance.transport.endpoint();
        request.for_each_node_ref(|node| {
            if node.endpoint.is_none() && node.relay.is_none() {
                node.relay = relay.clone();
            }
        });
        for target in targets {
            if let Err(e) = instance.transport.send(&target, request.clone()) {
                log::debug!("[DISCOVERY] failed to relay announcement: {}", e);
            }
        }
    }

    // ========================================================================
    // Lookup servant
    // ========================================================================

    fn dispatch(&self, current: Current, request: LookupRequest, responder: Responder) {
        let Some(instance) = self.instance.upgrade() else {
            responder.respond(Err(TransportError::AdapterDestroyed));
            return;
        };
        let connection = current.connection.as_ref();
        match &request {
            LookupRequest::CreateSession { node } => {
                let reply = self.accept(&instance, node, connection);
                let accepted = reply.is_ok();
                responder.respond(reply);
                if accepted {
                    if let Some(connection) = connection {
                        let lookup = Proxy::fixed(lookup_identity(), connection.clone());
                        self.announce_all(&instance, &lookup);
                    }
                }
                return;
            }
            LookupRequest::AnnounceTopicReader { name, node } => {
                if node.name != *instance.name && instance.topics.has(ElementKind::Writer, name) {
                    instance.node.create_publisher_session(node, connection);
                }
            }
            LookupRequest::AnnounceTopicWriter { name, node } => {
                if node.name != *instance.name && instance.topics.has(ElementKind::Reader, name) {
                    instance.node.create_subscriber_session(node, connection);
                }
            }
            LookupRequest::AnnounceTopics {
                readers,
                writers,
                node,
            } => {
                if node.name != *instance.name {
                    if readers
                        .iter()
                        .any(|name| instance.topics.has(ElementKind::Writer, name))
                    {
                        instance.node.create_publisher_session(node, connection);
                    }
                    if writers
                        .iter()
                        .any(|name| instance.topics.has(ElementKind::Reader, name))
                    {
                        instance.node.create_subscriber_session(node, connection);
                    }
                }
            }
        }
        let about = match &request {
            LookupRequest::AnnounceTopicReader { node, .. }
            | LookupRequest::AnnounceTopicWriter { node, .. }
            | LookupRequest::AnnounceTopics { node, .. }
            | LookupRequest::CreateSession { node } => node.name.clone(),
        };
        self.forward(&instance, &current, Request::Lookup(request), &about);
        responder.respond(Ok(Response::Done));
    }

    /// Accept a node session from `node`.
    fn accept(
        &self,
        instance: &Instance,
        node: &NodeRef,
        connection: Option<&Arc<dyn Connection>>,
    ) -> Reply {
        let connection = connection
            .cloned()
            .ok_or_else(|| TransportError::Protocol("node session over multicast".into()))?;
        {
            let mut state = self.state.lock();
            if state.stopped {
                return Err(TransportError::AdapterDestroyed);
            }
            state.sessions.insert(
                node.name.clone(),
                NodeSession {
                    lookup: Proxy::fixed(lookup_identity(), connection.clone()),
                    connection: connection.clone(),
                    inbound: true,
                    endpoint: None,
                },
            );
        }
        self.watch(&node.name, &connection);
        log::info!("[DISCOVERY] accepted node session from {}", node.name);
        Ok(Response::Node(instance.node_ref()))
    }

    pub(crate) fn shutdown(&self) {
        let sessions = {
            let mut state = self.state.lock();
            state.stopped = true;
            std::mem::take(&mut state.sessions)
        };
        if let Some(instance) = self.instance.upgrade() {
            instance.transport.unregister(&lookup_identity());
            instance.transport.unregister_category(FORWARDER_CATEGORY);
        }
        log::debug!("[DISCOVERY] stopped ({} node sessions)", sessions.len());
    }
}

struct LookupServant {
    instance: Weak<Instance>,
}

impl Dispatcher for LookupServant {
    fn dispatch(&self, current: Current, request: Request, responder: Responder) {
        let Some(instance) = self.instance.upgrade() else {
            responder.respond(Err(TransportError::AdapterDestroyed));
            return;
        };
        match request {
            Request::Lookup(request) => instance.discovery.dispatch(current, request, responder),
            _ => responder.respond(Err(TransportError::Protocol(
                "unexpected request on lookup servant".into(),
            ))),
        }
    }
}
