// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transport contract consumed by the engine.
//!
//! The engine never opens sockets itself. It talks to peers through a
//! [`Transport`] handle that provides:
//!
//! - one-way sends and two-way invocations with a reply continuation,
//! - servants addressed by [`Identity`] plus a facet string,
//! - proxies either dialed by endpoint or fixed to one [`Connection`],
//! - connection-close notifications,
//! - an optional multicast channel for discovery announcements.
//!
//! [`local`] provides an in-process implementation used by tests and by
//! applications running several nodes in one process.

pub mod local;

use crate::protocol::{NodeRef, Request, Response};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Identity of a servant on a transport adapter.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Identity {
    pub category: String,
    pub name: String,
}

impl Identity {
    pub fn new(category: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.category.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.category, self.name)
        }
    }
}

pub type ConnectionId = u64;

/// One physical connection as seen from the local side.
pub trait Connection: Send + Sync + fmt::Debug {
    fn id(&self) -> ConnectionId;

    /// Register a callback invoked once when the connection closes. If the
    /// connection is already closed the callback still runs (asynchronously).
    fn on_close(&self, callback: Box<dyn FnOnce(TransportError) + Send>);

    fn close(&self);

    fn is_closed(&self) -> bool;

    fn as_any(&self) -> &dyn Any;
}

/// Addressable handle to a remote servant.
#[derive(Clone)]
pub struct Proxy {
    pub identity: Identity,
    pub facet: String,
    pub endpoint: Option<String>,
    pub connection: Option<Arc<dyn Connection>>,
}

impl Proxy {
    /// Proxy dialed through `endpoint` on first use.
    pub fn direct(identity: Identity, endpoint: impl Into<String>) -> Self {
        Self {
            identity,
            facet: String::new(),
            endpoint: Some(endpoint.into()),
            connection: None,
        }
    }

    /// Proxy bound to an existing connection; unusable once it closes.
    pub fn fixed(identity: Identity, connection: Arc<dyn Connection>) -> Self {
        Self {
            identity,
            facet: String::new(),
            endpoint: None,
            connection: Some(connection),
        }
    }

    pub fn with_facet(&self, facet: impl Into<String>) -> Self {
        let mut proxy = self.clone();
        proxy.facet = facet.into();
        proxy
    }

    pub fn with_connection(&self, connection: Arc<dyn Connection>) -> Self {
        let mut proxy = self.clone();
        proxy.connection = Some(connection);
        proxy
    }

    pub fn is_fixed(&self) -> bool {
        self.connection.is_some()
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("identity", &self.identity.to_string())
            .field("facet", &self.facet)
            .field("endpoint", &self.endpoint)
            .field("connection", &self.connection.as_ref().map(|c| c.id()))
            .finish()
    }
}

/// Context of an incoming request.
#[derive(Clone)]
pub struct Current {
    pub identity: Identity,
    pub facet: String,
    /// Connection the request arrived on, `None` for multicast.
    pub connection: Option<Arc<dyn Connection>>,
}

impl Current {
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.connection.as_ref().map(|c| c.id())
    }
}

pub type Reply = Result<Response, TransportError>;
pub type ReplyCallback = Box<dyn FnOnce(Reply) + Send>;

/// Reply half of an incoming request. Dropping a two-way responder without
/// responding fails the request with [`TransportError::ConnectionLost`].
pub struct Responder(Option<ReplyCallback>);

impl Responder {
    pub fn new(callback: ReplyCallback) -> Self {
        Self(Some(callback))
    }

    /// Responder for one-way requests, replies are discarded.
    pub fn oneway() -> Self {
        Self(None)
    }

    pub fn respond(mut self, reply: Reply) {
        if let Some(callback) = self.0.take() {
            callback(reply);
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if let Some(callback) = self.0.take() {
            callback(Err(TransportError::ConnectionLost));
        }
    }
}

/// Servant receiving requests from a transport adapter.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, current: Current, request: Request, responder: Responder);
}

/// Per-node handle to the transport.
pub trait Transport: Send + Sync {
    /// Endpoint peers can dial to reach this node, if any.
    fn endpoint(&self) -> Option<String>;

    /// One-way send. Delivery is not confirmed; an error only reports that
    /// the request could not be handed to the connection.
    fn send(&self, target: &Proxy, request: Request) -> Result<(), TransportError>;

    /// Two-way invocation. `reply` always runs asynchronously, never on the
    /// calling thread.
    fn invoke(&self, target: &Proxy, request: Request, reply: ReplyCallback);

    /// Resolve the connection a proxy uses, establishing it if needed.
    fn connect(&self, target: &Proxy) -> Result<Arc<dyn Connection>, TransportError>;

    fn register(&self, identity: Identity, dispatcher: Arc<dyn Dispatcher>);

    fn unregister(&self, identity: &Identity);

    /// Default servant for every identity of `category`.
    fn register_category(&self, category: &str, dispatcher: Arc<dyn Dispatcher>);

    fn unregister_category(&self, category: &str);

    /// Deliver multicast discovery requests to `identity`.
    fn join_multicast(&self, _identity: Identity) -> Result<(), TransportError> {
        Err(TransportError::Protocol("multicast not supported".into()))
    }

    fn multicast(&self, _request: Request) -> Result<(), TransportError> {
        Err(TransportError::Protocol("multicast not supported".into()))
    }

    /// Close every connection and stop dispatching.
    fn shutdown(&self);
}

/// Rejections of the session creation handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionCreationError {
    AlreadyConnected,
    SessionNotFound,
    NodeShutdown,
    Internal,
}

impl fmt::Display for SessionCreationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionCreationError::AlreadyConnected => write!(f, "session already connected"),
            SessionCreationError::SessionNotFound => write!(f, "session not found"),
            SessionCreationError::NodeShutdown => write!(f, "node is shutting down"),
            SessionCreationError::Internal => write!(f, "internal session creation failure"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportError {
    /// Connection closed while or before the request was sent.
    ConnectionLost,
    /// No adapter listening on the endpoint.
    ConnectionRefused(String),
    /// No servant for the identity/facet.
    ObjectNotExist(String),
    Timeout,
    /// The peer (or local) adapter was destroyed.
    AdapterDestroyed,
    /// The whole transport was shut down.
    CommunicatorDestroyed,
    SessionCreation(SessionCreationError),
    Protocol(String),
}

impl TransportError {
    /// Errors after which retrying cannot succeed.
    pub fn is_shutdown(&self) -> bool {
        matches!(
            self,
            TransportError::AdapterDestroyed
                | TransportError::CommunicatorDestroyed
                | TransportError::SessionCreation(SessionCreationError::NodeShutdown)
        )
    }

    /// Lost handshake races, resolved by a concurrent attempt.
    pub fn is_benign_race(&self) -> bool {
        matches!(
            self,
            TransportError::SessionCreation(
                SessionCreationError::AlreadyConnected | SessionCreationError::SessionNotFound
            )
        )
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::ConnectionLost => write!(f, "connection lost"),
            TransportError::ConnectionRefused(endpoint) => {
                write!(f, "connection refused: {}", endpoint)
            }
            TransportError::ObjectNotExist(what) => write!(f, "object does not exist: {}", what),
            TransportError::Timeout => write!(f, "request timed out"),
            TransportError::AdapterDestroyed => write!(f, "adapter destroyed"),
            TransportError::CommunicatorDestroyed => write!(f, "transport destroyed"),
            TransportError::SessionCreation(e) => write!(f, "session creation failed: {}", e),
            TransportError::Protocol(msg) => write!(f, "protocol error: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

/// Resolve a node reference into a proxy for `identity` on that node.
///
/// - dialable nodes are reached directly,
/// - relayed nodes through the relay's forwarder servant (node servants only),
/// - otherwise through the connection the reference arrived on.
pub fn resolve(
    node: &NodeRef,
    identity: Identity,
    connection: Option<&Arc<dyn Connection>>,
) -> Option<Proxy> {
    if let Some(endpoint) = &node.endpoint {
        return Some(Proxy::direct(identity, endpoint.clone()));
    }
    if let Some(relay) = &node.relay {
        // The relay forwards to the node servant of `node.name`.
        let forwarded = Identity::new(crate::config::FORWARDER_CATEGORY, node.name.clone());
        return Some(Proxy::direct(forwarded, relay.clone()));
    }
    connection.map(|c| Proxy::fixed(identity, c.clone()))
}
