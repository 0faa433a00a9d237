// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Relay forwarder.
//!
//! Requests sent to `forward/<node>` are re-sent to the node servant of
//! `<node>` over its node session, keeping the facet. Node references
//! without an endpoint are rewritten to point at this relay so that the
//! receiver can answer through it.
//!
//! The forwarder remembers which session facets it carried. When the node
//! session of either end is lost, the other end is told its session is
//! disconnected, since its own connection (to the relay) stays up.

use crate::config::{NODE_CATEGORY, PUBLISHER_FACET, SUBSCRIBER_FACET};
use crate::core::instance::Instance;
use crate::protocol::{NodeRequest, Request, Response, SessionRequest};
use crate::transport::{Connection, Current, Dispatcher, Identity, Proxy, Responder, TransportError};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// Session traffic carried from `source` to the `target` facet `facet`.
struct Route {
    target: String,
    facet: String,
    source: String,
    source_connection: Arc<dyn Connection>,
}

pub(crate) struct Forwarder {
    instance: Weak<Instance>,
    routes: Mutex<Vec<Route>>,
}

impl Forwarder {
    pub(crate) fn new(instance: Weak<Instance>) -> Self {
        Self {
            instance,
            routes: Mutex::new(Vec::new()),
        }
    }

    fn remember(&self, target: &str, facet: &str, connection: &Arc<dyn Connection>) {
        // Session facets name the peer: "p/<source>" or "s/<source>".
        let Some((_, source)) = facet.split_once('/') else {
            return;
        };
        let mut routes = self.routes.lock();
        routes.retain(|r| !r.source_connection.is_closed());
        if routes
            .iter()
            .any(|r| r.target == target && r.facet == facet && r.source_connection.id() == connection.id())
        {
            return;
        }
        routes.push(Route {
            target: target.to_string(),
            facet: facet.to_string(),
            source: source.to_string(),
            source_connection: connection.clone(),
        });
    }

    /// The node session with `name` was lost: disconnect the sessions
    /// relayed to or from it.
    pub(crate) fn node_lost(&self, name: &str) {
        let Some(instance) = self.instance.upgrade() else {
            return;
        };
        let lost: Vec<Route> = {
            let mut routes = self.routes.lock();
            let (lost, kept) = std::mem::take(&mut *routes)
                .into_iter()
                .partition(|r| r.target == name || r.source == name);
            *routes = kept;
            lost
        };
        for route in lost {
            let proxy = if route.target == name {
                // Tell the source its session with the lost target is gone.
                let Some(facet) = flip(&route.facet, name) else {
                    continue;
                };
                Proxy::fixed(
                    Identity::new(NODE_CATEGORY, route.source.clone()),
                    route.source_connection.clone(),
                )
                .with_facet(facet)
            } else {
                let Some(connection) = instance.discovery.connection_to(&route.target) else {
                    continue;
                };
                Proxy::fixed(Identity::new(NODE_CATEGORY, route.target.clone()), connection)
                    .with_facet(route.facet.clone())
            };
            log::debug!("[FORWARD] disconnecting relayed session {:?}", proxy);
            if let Err(e) = instance
                .transport
                .send(&proxy, Request::Session(SessionRequest::Disconnected))
            {
                log::debug!("[FORWARD] failed to disconnect relayed session: {}", e);
            }
        }
    }
}

/// Facet of the session on the other end of `facet`, which is held by `node`.
fn flip(facet: &str, node: &str) -> Option<String> {
    let (prefix, _) = facet.split_once('/')?;
    let other = match prefix {
        PUBLISHER_FACET => SUBSCRIBER_FACET,
        SUBSCRIBER_FACET => PUBLISHER_FACET,
        _ => return None,
    };
    Some(format!("{}/{}", other, node))
}

impl Dispatcher for Forwarder {
    fn dispatch(&self, current: Current, mut request: Request, responder: Responder) {
        let Some(instance) = self.instance.upgrade() else {
            responder.respond(Err(TransportError::AdapterDestroyed));
            return;
        };
        let target = current.identity.name.clone();
        let Some(connection) = instance.discovery.connection_to(&target) else {
            log::debug!("[FORWARD] no node session with {}", target);
            responder.respond(Err(TransportError::ObjectNotExist(current.identity.to_string())));
            return;
        };
        if let (Request::Session(_), Some(source)) = (&request, &current.connection) {
            self.remember(&target, &current.facet, source);
        }

        let relay = instance.transport.endpoint();
        request.for_each_node_ref(|node| {
            if node.endpoint.is_none() && node.relay.is_none() {
                node.relay = relay.clone();
            }
        });
        let proxy = Proxy::fixed(Identity::new(NODE_CATEGORY, target), connection)
            .with_facet(current.facet);
        match request {
            Request::Node(NodeRequest::CreateSession { .. }) => {
                instance.transport.invoke(
                    &proxy,
                    request,
                    Box::new(move |reply| responder.respond(reply)),
                );
            }
            request => {
                let reply = instance.transport.send(&proxy, request).map(|_| Response::Done);
                responder.respond(reply);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Node;
    use crate::transport::local::LocalNetwork;
    use crate::transport::Transport;
    use std::sync::mpsc;
    use std::time::Duration;

    struct Recorder(Mutex<mpsc::Sender<String>>);

    impl Dispatcher for Recorder {
        fn dispatch(&self, current: Current, request: Request, _responder: Responder) {
            if let Request::Session(r) = request {
                let _ = self.0.lock().send(format!("{}:{}", current.facet, r.name()));
            }
        }
    }

    #[test]
    fn test_flip_session_facet() {
        assert_eq!(flip("p/alice", "bob").as_deref(), Some("s/bob"));
        assert_eq!(flip("s/alice", "bob").as_deref(), Some("p/bob"));
        assert_eq!(flip("alice", "bob"), None);
        assert_eq!(flip("x/alice", "bob"), None);
    }

    #[test]
    fn test_node_lost_disconnects_sources_despite_dead_routes() {
        let network = LocalNetwork::new();
        let relay = Node::builder("relay")
            .network(&network)
            .endpoint("relay")
            .build()
            .expect("relay");
        let transport = &relay.instance.transport;
        let forwarder = Forwarder::new(Arc::downgrade(&relay.instance));

        let alive = network.adapter(Some("alive")).expect("adapter");
        let dead = network.adapter(Some("dead")).expect("adapter");
        let (tx, rx) = mpsc::channel();
        alive.register(
            Identity::new(NODE_CATEGORY, "alice"),
            Arc::new(Recorder(Mutex::new(tx))),
        );

        let to_dead = transport
            .connect(&Proxy::direct(Identity::new(NODE_CATEGORY, "bob"), "dead"))
            .expect("connect dead");
        let to_alive = transport
            .connect(&Proxy::direct(Identity::new(NODE_CATEGORY, "alice"), "alive"))
            .expect("connect alive");
        forwarder.remember("target", "p/bob", &to_dead);
        forwarder.remember("target", "p/alice", &to_alive);
        dead.close_connections();

        forwarder.node_lost("target");
        let seen = rx.recv_timeout(Duration::from_secs(5)).expect("disconnect");
        assert_eq!(seen, "s/target:disconnected");
        assert!(forwarder.routes.lock().is_empty());
    }
}
