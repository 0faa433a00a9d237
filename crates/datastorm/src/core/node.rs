// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Node servant: session handshake and session registry.
//!
//! # Handshake
//!
//! ```text
//!  publisher node P                               subscriber node S
//!  create_publisher_session(S)
//!    |-- InitiateCreateSession(P) ----------------------->|
//!    |                                create_subscriber_session(P)
//!    |<---------- CreateSession(S, S session "s/P") ------|  (two-way)
//!  create_session()
//!    |-- ConfirmCreateSession(P, P session "p/S") ------->|
//!    |   P session connected, announces writers           |
//!    |<----------------------------------------- reply ---|
//!    |                                  confirm_create_session()
//!    |                                  S session connected, announces readers
//! ```
//!
//! Either side may start: a subscriber learning about a writer sends
//! `CreateSession` directly.

use crate::config::NODE_CATEGORY;
use crate::core::instance::Instance;
use crate::core::session::{Session, SessionKind};
use crate::core::topic::TopicCore;
use crate::protocol::{NodeRef, NodeRequest, Request, Response, SessionRef, SessionRequest};
use crate::transport::{
    self, Connection, Current, Dispatcher, Identity, Reply, Responder, SessionCreationError,
    TransportError,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

#[derive(Default)]
struct Sessions {
    /// Publisher sessions by subscriber node name.
    publishers: HashMap<String, Arc<Session>>,
    /// Subscriber sessions by publisher node name.
    subscribers: HashMap<String, Arc<Session>>,
}

impl Sessions {
    fn of(&mut self, kind: SessionKind) -> &mut HashMap<String, Arc<Session>> {
        match kind {
            SessionKind::Publisher => &mut self.publishers,
            SessionKind::Subscriber => &mut self.subscribers,
        }
    }
}

pub(crate) struct NodeCore {
    instance: Weak<Instance>,
    sessions: Mutex<Sessions>,
}

impl NodeCore {
    pub(crate) fn new(instance: Weak<Instance>) -> Self {
        Self {
            instance,
            sessions: Mutex::new(Sessions::default()),
        }
    }

    fn session(&self, kind: SessionKind, node: &NodeRef) -> Arc<Session> {
        let mut sessions = self.sessions.lock();
        sessions
            .of(kind)
            .entry(node.name.clone())
            .or_insert_with(|| {
                log::debug!("[NODE] new {:?} session with {}", kind, node.name);
                Arc::new(Session::new(kind, node.clone(), self.instance.clone()))
            })
            .clone()
    }

    pub(crate) fn find_session(&self, kind: SessionKind, name: &str) -> Option<Arc<Session>> {
        self.sessions.lock().of(kind).get(name).cloned()
    }

    /// Number of connected sessions of `kind`.
    pub(crate) fn connected_count(&self, kind: SessionKind) -> usize {
        self.sessions
            .lock()
            .of(kind)
            .values()
            .filter(|s| s.is_connected())
            .count()
    }

    // ========================================================================
    // Handshake
    // ========================================================================

    /// Ask the subscriber node `subscriber` to create a session with us.
    pub(crate) fn create_publisher_session(
        &self,
        subscriber: &NodeRef,
        connection: Option<&Arc<dyn Connection>>,
    ) {
        let Some(instance) = self.instance.upgrade() else {
            return;
        };
        if instance.is_shutdown() || subscriber.name == *instance.name {
            return;
        }
        let session = self.session(SessionKind::Publisher, subscriber);
        if session.is_connected() {
            return;
        }
        let identity = Identity::new(NODE_CATEGORY, subscriber.name.clone());
        let Some(proxy) = transport::resolve(subscriber, identity, connection) else {
            log::debug!("[NODE] no route to subscriber {}", subscriber.name);
            return;
        };
        let request = Request::Node(NodeRequest::InitiateCreateSession {
            publisher: instance.node_ref(),
        });
        if let Err(e) = instance.transport.send(&proxy, request) {
            log::debug!("[NODE] initiate session with {} failed: {}", subscriber.name, e);
            self.session_failed(&session, &e);
        }
    }

    /// Create the subscriber session for `publisher` and ask it to connect.
    pub(crate) fn create_subscriber_session(
        &self,
        publisher: &NodeRef,
        connection: Option<&Arc<dyn Connection>>,
    ) {
        let Some(instance) = self.instance.upgrade() else {
            return;
        };
        if instance.is_shutdown() || publisher.name == *instance.name {
            return;
        }
        let session = self.session(SessionKind::Subscriber, publisher);
        if session.is_connected() {
            return;
        }
        let identity = Identity::new(NODE_CATEGORY, publisher.name.clone());
        let Some(proxy) = transport::resolve(publisher, identity, connection) else {
            log::debug!("[NODE] no route to publisher {}", publisher.name);
            return;
        };
        let own = instance.node_ref();
        let request = Request::Node(NodeRequest::CreateSession {
            subscriber: own.clone(),
            subscriber_session: SessionRef {
                node: own,
                facet: session.facet().to_string(),
            },
            from_relay: false,
        });
        let weak = self.instance.clone();
        let name = publisher.name.clone();
        instance.transport.invoke(
            &proxy,
            request,
            Box::new(move |reply: Reply| {
                let Err(e) = reply else {
                    return;
                };
                log::debug!("[NODE] create session with {} failed: {}", name, e);
                if let Some(instance) = weak.upgrade() {
                    instance.node.session_failed(&session, &e);
                }
            }),
        );
    }

    /// Publisher side of `CreateSession`.
    fn create_session(
        &self,
        subscriber: NodeRef,
        subscriber_session: SessionRef,
        current: &Current,
    ) -> Reply {
        let instance = self
            .instance
            .upgrade()
            .ok_or(TransportError::SessionCreation(SessionCreationError::NodeShutdown))?;
        if instance.is_shutdown() {
            return Err(TransportError::SessionCreation(SessionCreationError::NodeShutdown));
        }
        let session = self.session(SessionKind::Publisher, &subscriber);
        if session.is_connected() {
            return Err(TransportError::SessionCreation(SessionCreationError::AlreadyConnected));
        }

        let identity = Identity::new(NODE_CATEGORY, subscriber.name.clone());
        let node_proxy = transport::resolve(
            &subscriber_session.node,
            identity,
            current.connection.as_ref(),
        )
        .ok_or(TransportError::SessionCreation(SessionCreationError::Internal))?;
        let connection = instance.transport.connect(&node_proxy)?;
        let node_proxy = node_proxy.with_connection(connection.clone());
        let proxy = node_proxy.with_facet(subscriber_session.facet);

        let own = instance.node_ref();
        instance.transport.send(
            &node_proxy,
            Request::Node(NodeRequest::ConfirmCreateSession {
                publisher: own.clone(),
                publisher_session: SessionRef {
                    node: own,
                    facet: session.facet().to_string(),
                },
            }),
        )?;
        session.connected(proxy, connection, subscriber);
        Ok(Response::Done)
    }

    /// Subscriber side of `ConfirmCreateSession`.
    fn confirm_create_session(
        &self,
        publisher: NodeRef,
        publisher_session: SessionRef,
        current: &Current,
    ) -> Reply {
        let instance = self
            .instance
            .upgrade()
            .ok_or(TransportError::SessionCreation(SessionCreationError::NodeShutdown))?;
        let session = self
            .find_session(SessionKind::Subscriber, &publisher.name)
            .ok_or(TransportError::SessionCreation(SessionCreationError::SessionNotFound))?;
        if session.is_connected() {
            return Err(TransportError::SessionCreation(SessionCreationError::AlreadyConnected));
        }

        let identity = Identity::new(NODE_CATEGORY, publisher.name.clone());
        let proxy = transport::resolve(
            &publisher_session.node,
            identity,
            current.connection.as_ref(),
        )
        .ok_or(TransportError::SessionCreation(SessionCreationError::Internal))?;
        let connection = instance.transport.connect(&proxy)?;
        let proxy = proxy
            .with_connection(connection.clone())
            .with_facet(publisher_session.facet);
        session.connected(proxy, connection, publisher);
        Ok(Response::Done)
    }

    // ========================================================================
    // Session lifecycle
    // ========================================================================

    /// Retry or remove a session after `err`.
    pub(crate) fn session_failed(&self, session: &Arc<Session>, err: &TransportError) {
        if !session.retry(err) {
            self.remove_session(session);
        }
    }

    pub(crate) fn remove_session(&self, session: &Arc<Session>) {
        let removed = {
            let mut sessions = self.sessions.lock();
            let map = sessions.of(session.kind());
            match map.get(&**session.id()) {
                Some(existing) if Arc::ptr_eq(existing, session) => map.remove(&**session.id()),
                _ => None,
            }
        };
        if removed.is_some() {
            log::debug!("[NODE] removed {:?} session with {}", session.kind(), session.id());
        }
        session.destroy();
    }

    /// Announce a new local topic on every connected session of its role.
    pub(crate) fn announce_topic(&self, topic: &TopicCore) {
        let kind = if topic.is_reader() {
            SessionKind::Subscriber
        } else {
            SessionKind::Publisher
        };
        let sessions: Vec<Arc<Session>> = self.sessions.lock().of(kind).values().cloned().collect();
        for session in sessions {
            if session.is_connected() {
                session.announce_topic(topic);
            }
        }
    }

    /// Destroy every session.
    pub(crate) fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.lock();
            let Sessions {
                publishers,
                subscribers,
            } = &mut *sessions;
            publishers
                .drain()
                .chain(subscribers.drain())
                .map(|(_, s)| s)
                .collect()
        };
        for session in sessions {
            session.destroy();
        }
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    fn dispatch_node(&self, current: &Current, request: NodeRequest, responder: Responder) {
        match request {
            NodeRequest::InitiateCreateSession { publisher } => {
                self.create_subscriber_session(&publisher, current.connection.as_ref());
                responder.respond(Ok(Response::Done));
            }
            NodeRequest::CreateSession {
                subscriber,
                subscriber_session,
                ..
            } => {
                let reply = self.create_session(subscriber, subscriber_session, current);
                if let Err(e) = &reply {
                    log::debug!("[NODE] rejected session creation: {}", e);
                }
                responder.respond(reply);
            }
            NodeRequest::ConfirmCreateSession {
                publisher,
                publisher_session,
            } => {
                let reply = self.confirm_create_session(publisher, publisher_session, current);
                if let Err(e) = &reply {
                    log::debug!("[NODE] ignored session confirmation: {}", e);
                }
                responder.respond(reply);
            }
        }
    }

    fn dispatch_session(&self, current: &Current, request: SessionRequest) {
        let session = current
            .facet
            .split_once('/')
            .and_then(|(prefix, peer)| match prefix {
                crate::config::PUBLISHER_FACET => self.find_session(SessionKind::Publisher, peer),
                crate::config::SUBSCRIBER_FACET => {
                    self.find_session(SessionKind::Subscriber, peer)
                }
                _ => None,
            });
        match session {
            Some(session) => session.dispatch(current, request),
            None => log::trace!(
                "[NODE] no session for facet `{}`, dropping {}",
                current.facet,
                request.name()
            ),
        }
    }
}

/// Transport servant registered under the node identity.
pub(crate) struct NodeServant {
    pub(crate) instance: Weak<Instance>,
}

impl Dispatcher for NodeServant {
    fn dispatch(&self, current: Current, request: Request, responder: Responder) {
        let Some(instance) = self.instance.upgrade() else {
            responder.respond(Err(TransportError::AdapterDestroyed));
            return;
        };
        match request {
            Request::Node(request) => instance.node.dispatch_node(&current, request, responder),
            Request::Session(request) => {
                instance.node.dispatch_session(&current, request);
                responder.respond(Ok(Response::Done));
            }
            Request::Lookup(_) => responder.respond(Err(TransportError::Protocol(
                "lookup request sent to node servant".into(),
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Node;
    use crate::config::{props, RuntimeConfig};
    use crate::transport::local::LocalNetwork;
    use std::time::{Duration, Instant};

    fn local_node(network: &LocalNetwork, delay_ms: &str, count: &str) -> Node {
        let config = RuntimeConfig::new();
        config.set(props::NODE_RETRY_DELAY, delay_ms);
        config.set(props::NODE_RETRY_MULTIPLIER, "1");
        config.set(props::NODE_RETRY_COUNT, count);
        Node::builder("local")
            .network(network)
            .config(config)
            .build()
            .expect("node")
    }

    fn eventually(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond() {
            if Instant::now() > deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        true
    }

    #[test]
    fn test_retry_count_bounds_attempts() {
        let network = LocalNetwork::new();
        let node = local_node(&network, "60000", "3");
        let ghost = NodeRef::new("ghost", Some("nowhere".to_string()));
        let session = Arc::new(Session::new(
            SessionKind::Subscriber,
            ghost,
            Arc::downgrade(&node.instance),
        ));
        for attempt in 0..3 {
            assert!(session.retry(&TransportError::ConnectionLost), "attempt {}", attempt);
        }
        assert!(!session.retry(&TransportError::ConnectionLost));
    }

    #[test]
    fn test_unreachable_peer_session_removed_after_retries() {
        let network = LocalNetwork::new();
        let node = local_node(&network, "5", "2");
        let core = &node.instance.node;
        let ghost = NodeRef::new("ghost", Some("nowhere".to_string()));

        core.create_subscriber_session(&ghost, None);
        assert!(eventually(|| core.find_session(SessionKind::Subscriber, "ghost").is_none()));
        assert_eq!(core.connected_count(SessionKind::Subscriber), 0);
    }

    #[test]
    fn test_peer_shutdown_exhausts_retries() {
        let network = LocalNetwork::new();
        let node = local_node(&network, "5", "2");
        let peer = Node::builder("peer")
            .network(&network)
            .endpoint("node-peer")
            .build()
            .expect("peer");
        let core = &node.instance.node;

        core.create_subscriber_session(&NodeRef::new("peer", Some("node-peer".into())), None);
        assert!(eventually(|| core.connected_count(SessionKind::Subscriber) == 1));

        peer.shutdown();
        assert!(eventually(|| core.find_session(SessionKind::Subscriber, "peer").is_none()));
    }

    #[test]
    fn test_undialable_peer_gets_twice_the_delay() {
        let network = LocalNetwork::new();
        let node = local_node(&network, "20", "6");
        let core = &node.instance.node;
        let hidden = NodeRef::new("hidden", None);
        let session = core.session(SessionKind::Subscriber, &hidden);

        let start = Instant::now();
        assert!(session.retry(&TransportError::ConnectionLost));
        assert!(core.find_session(SessionKind::Subscriber, "hidden").is_some());
        assert!(eventually(|| core.find_session(SessionKind::Subscriber, "hidden").is_none()));
        assert!(start.elapsed() >= Duration::from_millis(40));

        // Destroyed sessions never retry.
        assert!(!session.retry(&TransportError::ConnectionLost));
    }

    #[test]
    fn test_session_not_found_drops_idle_session() {
        let network = LocalNetwork::new();
        let node = local_node(&network, "60000", "6");
        let core = &node.instance.node;
        let peer = NodeRef::new("peer", Some("somewhere".to_string()));
        let session = core.session(SessionKind::Subscriber, &peer);

        // Lost race with a concurrent handshake: keep waiting for it.
        core.session_failed(
            &session,
            &TransportError::SessionCreation(SessionCreationError::AlreadyConnected),
        );
        assert!(core.find_session(SessionKind::Subscriber, "peer").is_some());

        core.session_failed(
            &session,
            &TransportError::SessionCreation(SessionCreationError::SessionNotFound),
        );
        assert!(core.find_session(SessionKind::Subscriber, "peer").is_none());
    }
}
