// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Publisher and subscriber sessions.
//!
//! A node keeps one session per peer node and role: the publisher session
//! carries the local writer topics to the peer's readers, the subscriber
//! session receives the peer's writer samples for the local readers.
//!
//! ```text
//!            connected()                     connection lost
//!  [created] ------------> [connected] -------------------------+
//!      ^                        ^                               v
//!      |                        +---- connected() ------ [disconnected]
//!      |                                                        |
//!      +------------- retry timer (reconnect) <-----------------+
//!                                                               |
//!                       retries exhausted / shutdown --> [destroyed]
//! ```
//!
//! The session servant is registered on the node identity under the facet
//! `p/<peer>` or `s/<peer>`. Requests arriving over any other connection
//! than the current one are stale and ignored.

use crate::core::element::ElementKind;
use crate::core::instance::Instance;
use crate::core::timer::TimerId;
use crate::core::topic::TopicCore;
use crate::protocol::{NodeRef, Request, SessionRequest};
use crate::transport::{
    Connection, ConnectionId, Current, Proxy, SessionCreationError, TransportError,
};
use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum SessionKind {
    Publisher,
    Subscriber,
}

impl SessionKind {
    /// Role of the local topics served by sessions of this kind.
    pub(crate) fn topic_kind(self) -> ElementKind {
        match self {
            SessionKind::Publisher => ElementKind::Writer,
            SessionKind::Subscriber => ElementKind::Reader,
        }
    }

    fn facet_prefix(self) -> &'static str {
        match self {
            SessionKind::Publisher => crate::config::PUBLISHER_FACET,
            SessionKind::Subscriber => crate::config::SUBSCRIBER_FACET,
        }
    }
}

struct SessionState {
    /// Last known reference of the peer node.
    node: NodeRef,
    connection: Option<Arc<dyn Connection>>,
    /// Remote topic id -> local topics attached to it.
    topics: HashMap<i64, Vec<Arc<TopicCore>>>,
    retry_attempt: u32,
    retry_timer: Option<TimerId>,
    destroyed: bool,
}

pub(crate) struct Session {
    /// Peer node name.
    id: Arc<str>,
    kind: SessionKind,
    facet: String,
    instance: Weak<Instance>,
    /// Peer session servant; `None` while disconnected. Read without the
    /// session lock so topics can send while holding their own lock.
    peer: ArcSwapOption<Proxy>,
    /// Bumped on every connection, tags the subscription tables.
    instance_id: AtomicU64,
    state: Mutex<SessionState>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Session {
    pub(crate) fn new(kind: SessionKind, node: NodeRef, instance: Weak<Instance>) -> Self {
        Self {
            id: Arc::from(node.name.as_str()),
            kind,
            facet: format!("{}/{}", kind.facet_prefix(), node.name),
            instance,
            peer: ArcSwapOption::empty(),
            instance_id: AtomicU64::new(0),
            state: Mutex::new(SessionState {
                node,
                connection: None,
                topics: HashMap::new(),
                retry_attempt: 0,
                retry_timer: None,
                destroyed: false,
            }),
        }
    }

    pub(crate) fn id(&self) -> &Arc<str> {
        &self.id
    }

    pub(crate) fn kind(&self) -> SessionKind {
        self.kind
    }

    /// Facet of our servant for this session.
    pub(crate) fn facet(&self) -> &str {
        &self.facet
    }

    pub(crate) fn instance_id(&self) -> u64 {
        self.instance_id.load(Ordering::Acquire)
    }

    pub(crate) fn node(&self) -> NodeRef {
        self.state.lock().node.clone()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.peer
            .load()
            .as_ref()
            .is_some_and(|p| p.connection.as_ref().is_some_and(|c| !c.is_closed()))
    }

    /// Send a one-way request to the peer session, dropped while
    /// disconnected.
    pub(crate) fn send(&self, request: SessionRequest) {
        let peer = self.peer.load();
        let Some(peer) = peer.as_ref() else {
            log::trace!("[SESSION] {}: dropping {} while disconnected", self.id, request.name());
            return;
        };
        let Some(instance) = self.instance.upgrade() else {
            return;
        };
        let name = request.name();
        if let Err(e) = instance.transport.send(peer, Request::Session(request)) {
            log::debug!("[SESSION] {}: failed to send {}: {}", self.id, name, e);
        }
    }

    // ========================================================================
    // Connection lifecycle
    // ========================================================================

    /// Bind the session to the peer session `proxy` reached over
    /// `connection` and announce the local topics. Returns `false` if the
    /// session is already connected or destroyed.
    pub(crate) fn connected(
        self: &Arc<Self>,
        proxy: Proxy,
        connection: Arc<dyn Connection>,
        node: NodeRef,
    ) -> bool {
        let Some(instance) = self.instance.upgrade() else {
            return false;
        };
        let mut state = self.state.lock();
        if state.destroyed || instance.is_shutdown() || self.is_connected() {
            return false;
        }
        if let Some(timer) = state.retry_timer.take() {
            instance.timer.cancel(timer);
        }
        state.retry_attempt = 0;
        state.node = node;
        state.connection = Some(connection.clone());
        self.instance_id.fetch_add(1, Ordering::AcqRel);
        self.peer.store(Some(Arc::new(proxy)));

        let weak = Arc::downgrade(self);
        let connection_id = connection.id();
        connection.on_close(Box::new(move |err| {
            if let Some(session) = weak.upgrade() {
                session.connection_closed(connection_id, err);
            }
        }));

        log::debug!(
            "[SESSION] {:?} session with {} connected (connection {})",
            self.kind,
            self.id,
            connection_id
        );
        let topics = instance.topics.infos(self.kind.topic_kind());
        self.send(SessionRequest::AnnounceTopics {
            topics,
            initialize: true,
        });
        true
    }

    fn connection_closed(self: &Arc<Self>, connection: ConnectionId, err: TransportError) {
        if !self.disconnected(Some(connection)) {
            return;
        }
        if let Some(instance) = self.instance.upgrade() {
            instance.node.session_failed(self, &err);
        }
    }

    /// Drop the current connection. With `connection`, only if it is still
    /// the current one. Returns `false` when there was nothing to drop.
    pub(crate) fn disconnected(&self, connection: Option<ConnectionId>) -> bool {
        let Some(instance) = self.instance.upgrade() else {
            return false;
        };
        let mut state = self.state.lock();
        let Some(current) = &state.connection else {
            return false;
        };
        if connection.is_some_and(|id| id != current.id()) {
            return false;
        }
        state.connection = None;
        state.topics.clear();
        self.peer.store(None);
        for topic in instance.topics.all(self.kind.topic_kind()) {
            topic.detach_session(&self.id);
        }
        log::debug!("[SESSION] {:?} session with {} disconnected", self.kind, self.id);
        true
    }

    /// Schedule a reconnection after `err`. Returns `false` when the
    /// session should be removed instead.
    pub(crate) fn retry(self: &Arc<Self>, err: &TransportError) -> bool {
        let Some(instance) = self.instance.upgrade() else {
            return false;
        };
        if instance.is_shutdown() || err.is_shutdown() {
            return false;
        }
        let mut state = self.state.lock();
        if state.destroyed {
            return false;
        }
        if err.is_benign_race() {
            // A concurrent handshake owns the connection. If the peer no
            // longer knows us and nothing connected, drop the session; the
            // next announcement recreates it.
            let orphaned = !self.is_connected()
                && matches!(
                    err,
                    TransportError::SessionCreation(SessionCreationError::SessionNotFound)
                );
            if orphaned {
                log::debug!("[SESSION] {}: peer has no matching session", self.id);
            }
            return !orphaned;
        }
        if let Some(timer) = state.retry_timer.take() {
            instance.timer.cancel(timer);
        }
        let policy = instance.config.retry_policy();
        let weak = Arc::downgrade(self);

        if !state.node.is_dialable() {
            // Only the peer can reconnect; give it twice the retry delay.
            let delay = policy.delay(state.retry_attempt).saturating_mul(2);
            log::debug!(
                "[SESSION] {}: waiting {:?} for the peer to reconnect",
                self.id,
                delay
            );
            state.retry_timer = Some(instance.timer.schedule(delay, move || {
                if let Some(session) = weak.upgrade() {
                    session.retry_expired();
                }
            }));
            return true;
        }

        // `retry_count` reconnection attempts in total, the first immediate.
        if state.retry_attempt >= policy.retry_count {
            log::debug!("[SESSION] {}: giving up after {} attempts", self.id, state.retry_attempt);
            return false;
        }
        let delay = if state.retry_attempt == 0 {
            Duration::ZERO
        } else {
            policy.delay(state.retry_attempt)
        };
        state.retry_attempt += 1;
        log::debug!(
            "[SESSION] {}: reconnecting in {:?} (attempt {}): {}",
            self.id,
            delay,
            state.retry_attempt,
            err
        );
        state.retry_timer = Some(instance.timer.schedule(delay, move || {
            if let Some(session) = weak.upgrade() {
                session.reconnect();
            }
        }));
        true
    }

    fn retry_expired(self: &Arc<Self>) {
        self.state.lock().retry_timer = None;
        if self.is_connected() {
            return;
        }
        if let Some(instance) = self.instance.upgrade() {
            log::debug!("[SESSION] {}: peer did not reconnect", self.id);
            instance.node.remove_session(self);
        }
    }

    fn reconnect(self: &Arc<Self>) {
        let node = {
            let mut state = self.state.lock();
            state.retry_timer = None;
            if state.destroyed {
                return;
            }
            state.node.clone()
        };
        if self.is_connected() {
            return;
        }
        let Some(instance) = self.instance.upgrade() else {
            return;
        };
        match self.kind {
            SessionKind::Subscriber => instance.node.create_subscriber_session(&node, None),
            SessionKind::Publisher => instance.node.create_publisher_session(&node, None),
        }
    }

    /// Tell the peer and release every topic attachment.
    pub(crate) fn destroy(&self) {
        let Some(instance) = self.instance.upgrade() else {
            return;
        };
        {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            if let Some(timer) = state.retry_timer.take() {
                instance.timer.cancel(timer);
            }
            if self.is_connected() {
                self.send(SessionRequest::Disconnected);
            }
            state.connection = None;
            state.topics.clear();
            self.peer.store(None);
        }
        for topic in instance.topics.all(self.kind.topic_kind()) {
            topic.remove_session(&self.id);
        }
        log::debug!("[SESSION] {:?} session with {} destroyed", self.kind, self.id);
    }

    // ========================================================================
    // Local topic changes
    // ========================================================================

    /// Announce a topic created after the session connected.
    pub(crate) fn announce_topic(&self, topic: &TopicCore) {
        self.send(SessionRequest::AnnounceTopics {
            topics: vec![topic.info()],
            initialize: false,
        });
    }

    pub(crate) fn detach_local_topic(&self, topic: &Arc<TopicCore>) {
        {
            let mut state = self.state.lock();
            state.topics.retain(|_, topics| {
                topics.retain(|t| !Arc::ptr_eq(t, topic));
                !topics.is_empty()
            });
        }
        self.send(SessionRequest::DetachTopic(topic.id));
    }

    // ========================================================================
    // Incoming requests
    // ========================================================================

    pub(crate) fn dispatch(self: &Arc<Self>, current: &Current, request: SessionRequest) {
        let Some(instance) = self.instance.upgrade() else {
            return;
        };
        if let SessionRequest::Disconnected = request {
            if self.disconnected(current.connection_id()) {
                instance.node.session_failed(self, &TransportError::ConnectionLost);
            }
            return;
        }

        let mut state = self.state.lock();
        let current_connection = state.connection.as_ref().map(|c| c.id());
        if current_connection.is_none() || current_connection != current.connection_id() {
            log::trace!(
                "[SESSION] {}: ignoring {} from stale connection",
                self.id,
                request.name()
            );
            return;
        }
        let instance_id = self.instance_id();
        let kind = self.kind.topic_kind();

        match request {
            SessionRequest::AnnounceTopics { topics, initialize } => {
                for info in &topics {
                    for local in instance.topics.topics(kind, &info.name) {
                        for &remote in &info.ids {
                            local.attach_session(self, remote, instance_id);
                            remember(&mut state, remote, &local);
                        }
                        self.send(SessionRequest::AttachTopic(local.spec()));
                    }
                }
                if initialize {
                    for local in instance.topics.all(kind) {
                        local.reap_topics(&self.id, instance_id);
                    }
                }
            }
            SessionRequest::AttachTopic(spec) => {
                for local in instance.topics.topics(kind, &spec.name) {
                    local.attach_session(self, spec.id, instance_id);
                    remember(&mut state, spec.id, &local);
                    local.attach_tags(&self.id, spec.id, &spec.tags, true);
                    let tags = local.shared.tag_infos();
                    if !tags.is_empty() {
                        self.send(SessionRequest::AttachTags {
                            topic: local.id,
                            tags,
                            initialize: true,
                        });
                    }
                    let elements = local.element_specs(&self.id, spec.id, &spec.elements);
                    self.send(SessionRequest::AttachElements {
                        topic: local.id,
                        elements,
                        initialize: true,
                    });
                }
            }
            SessionRequest::DetachTopic(remote) => {
                for local in state.topics.remove(&remote).unwrap_or_default() {
                    local.detach_remote_topic(&self.id, remote);
                }
            }
            SessionRequest::AttachTags {
                topic,
                tags,
                initialize,
            } => {
                for local in attached(&state, topic) {
                    local.attach_tags(&self.id, topic, &tags, initialize);
                }
            }
            SessionRequest::DetachTags { topic, tags } => {
                for local in attached(&state, topic) {
                    local.detach_tags(&self.id, topic, &tags);
                }
            }
            SessionRequest::AnnounceElements { topic, elements } => {
                for local in attached(&state, topic) {
                    let specs = local.element_specs(&self.id, topic, &elements);
                    if !specs.is_empty() {
                        self.send(SessionRequest::AttachElements {
                            topic: local.id,
                            elements: specs,
                            initialize: false,
                        });
                    }
                }
            }
            SessionRequest::AttachElements {
                topic,
                elements,
                initialize,
            } => {
                for local in attached(&state, topic) {
                    local.attach_elements(self, topic, &elements, initialize, instance_id);
                }
            }
            SessionRequest::AttachElementsAck { topic, elements } => {
                let mut pending = Vec::new();
                for local in attached(&state, topic) {
                    let inits = local.attach_elements_ack(self, topic, &elements, instance_id);
                    pending.push((local, inits));
                }
                for (local, inits) in pending {
                    for init in inits {
                        local.init_samples(&self.id, init.remote_topic, &init.samples);
                    }
                }
            }
            SessionRequest::DetachElements {
                topic,
                elements,
                element,
            } => {
                for local in attached(&state, topic) {
                    local.detach_elements(&self.id, topic, &elements, element);
                }
            }
            SessionRequest::InitSamples { topic, samples } => {
                for local in attached(&state, topic) {
                    for data in &samples {
                        local.init_samples(&self.id, topic, data);
                    }
                }
            }
            SessionRequest::Sample {
                topic,
                element,
                origin,
                sample,
            } => {
                for local in attached(&state, topic) {
                    local.deliver(&self.id, topic, element, origin, &sample);
                }
            }
            SessionRequest::Disconnected => {}
        }
    }
}

fn remember(state: &mut SessionState, remote: i64, local: &Arc<TopicCore>) {
    let topics = state.topics.entry(remote).or_default();
    if !topics.iter().any(|t| Arc::ptr_eq(t, local)) {
        topics.push(local.clone());
    }
}

fn attached(state: &SessionState, remote: i64) -> Vec<Arc<TopicCore>> {
    state.topics.get(&remote).cloned().unwrap_or_default()
}
