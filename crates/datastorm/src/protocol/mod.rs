// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire-level protocol messages exchanged between nodes.
//!
//! Everything here is plain data: the engine never puts live objects on the
//! wire, only ids, names and encoded bytes. Peers are referenced by
//! [`NodeRef`]/[`SessionRef`] values that the receiver resolves into a
//! transport [`Proxy`](crate::transport::Proxy).
//!
//! # Attach sequence
//!
//! ```text
//! Node A (writer topic)                         Node B (reader topic)
//!    |-- AnnounceTopics([TopicInfo], init) -------->|
//!    |<------------------- AttachTopic(TopicSpec) --|
//!    |-- AttachTags + AttachElements(specs) ------->|
//!    |<------------ AttachElementsAck(spec acks) ---|
//!    |-- InitSamples([DataSamples]) --------------->|
//!    |-- Sample(topic, element, DataSample) ------->|   (live)
//! ```

use std::collections::HashMap;

/// Kind of event carried by a sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SampleEvent {
    Add,
    Update,
    PartialUpdate,
    Remove,
}

impl SampleEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            SampleEvent::Add => "Add",
            SampleEvent::Update => "Update",
            SampleEvent::PartialUpdate => "PartialUpdate",
            SampleEvent::Remove => "Remove",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Add" => Some(SampleEvent::Add),
            "Update" => Some(SampleEvent::Update),
            "PartialUpdate" => Some(SampleEvent::PartialUpdate),
            "Remove" => Some(SampleEvent::Remove),
            _ => None,
        }
    }
}

impl std::fmt::Display for SampleEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When the history of a key is wiped before a new sample is retained.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ClearHistoryPolicy {
    OnAdd,
    OnRemove,
    OnAll,
    OnAllExceptPartialUpdate,
    Never,
}

impl ClearHistoryPolicy {
    /// Whether a sample with `event` wipes the existing history under this policy.
    pub fn clears_on(self, event: SampleEvent) -> bool {
        match self {
            ClearHistoryPolicy::OnAdd => event == SampleEvent::Add,
            ClearHistoryPolicy::OnRemove => event == SampleEvent::Remove,
            ClearHistoryPolicy::OnAll => true,
            ClearHistoryPolicy::OnAllExceptPartialUpdate => event != SampleEvent::PartialUpdate,
            ClearHistoryPolicy::Never => false,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OnAdd" => Some(ClearHistoryPolicy::OnAdd),
            "OnRemove" => Some(ClearHistoryPolicy::OnRemove),
            "OnAll" => Some(ClearHistoryPolicy::OnAll),
            "OnAllExceptPartialUpdate" => Some(ClearHistoryPolicy::OnAllExceptPartialUpdate),
            "Never" => Some(ClearHistoryPolicy::Never),
            _ => None,
        }
    }
}

/// Reader-side policy applied before a received sample is queued.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DiscardPolicy {
    None,
    SendTime,
    Priority,
}

impl DiscardPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "None" => Some(DiscardPolicy::None),
            "SendTime" => Some(DiscardPolicy::SendTime),
            "Priority" => Some(DiscardPolicy::Priority),
            _ => None,
        }
    }
}

/// One sample as it travels on the wire.
#[derive(Clone, Debug, PartialEq)]
pub struct DataSample {
    pub id: i64,
    /// Key id in the sender's key factory, `0` when the sample has no key.
    pub key_id: i64,
    /// Encoded key, only set when the receiver cannot infer the key from the
    /// element it is attached through (filter attachments).
    pub key_value: Vec<u8>,
    /// Microseconds since the UNIX epoch, strictly increasing per topic.
    pub timestamp: i64,
    /// Tag id in the sender's tag factory, `0` when untagged.
    pub tag: i64,
    pub event: SampleEvent,
    pub value: Vec<u8>,
}

/// Initial samples for one attached (writer element, reader element) pair.
#[derive(Clone, Debug, PartialEq)]
pub struct DataSamples {
    /// Attach id (sender key id or negated filter id).
    pub id: i64,
    /// Sender data element id.
    pub origin: i64,
    /// Receiver data element id.
    pub peer: i64,
    pub samples: Vec<DataSample>,
}

/// A key (`id > 0`), a filter (`id < 0`) or a tag announced by a topic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ElementInfo {
    pub id: i64,
    /// Filter name; empty for keys, tags and the always-match filter.
    pub name: String,
    pub value: Vec<u8>,
}

/// Topic announced by name with the ids of every local topic instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicInfo {
    pub name: String,
    pub ids: Vec<i64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicSpec {
    pub id: i64,
    pub name: String,
    pub elements: Vec<ElementInfo>,
    pub tags: Vec<ElementInfo>,
}

/// Named filter with encoded criteria.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FilterInfo {
    pub name: String,
    pub criteria: Vec<u8>,
}

/// Per-element settings. Every field is optional so that element, topic and
/// property defaults can be layered with [`ElementConfig::merged`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ElementConfig {
    pub facet: Option<String>,
    pub sample_filter: Option<FilterInfo>,
    pub name: Option<String>,
    pub priority: Option<i32>,
    pub sample_count: Option<i32>,
    /// Milliseconds, `0` keeps samples forever.
    pub sample_lifetime: Option<i32>,
    pub clear_history: Option<ClearHistoryPolicy>,
    pub discard_policy: Option<DiscardPolicy>,
}

impl ElementConfig {
    /// Fill unset fields from `defaults`.
    pub fn merged(&self, defaults: &ElementConfig) -> ElementConfig {
        ElementConfig {
            facet: self.facet.clone().or_else(|| defaults.facet.clone()),
            sample_filter: self
                .sample_filter
                .clone()
                .or_else(|| defaults.sample_filter.clone()),
            name: self.name.clone().or_else(|| defaults.name.clone()),
            priority: self.priority.or(defaults.priority),
            sample_count: self.sample_count.or(defaults.sample_count),
            sample_lifetime: self.sample_lifetime.or(defaults.sample_lifetime),
            clear_history: self.clear_history.or(defaults.clear_history),
            discard_policy: self.discard_policy.or(defaults.discard_policy),
        }
    }
}

/// One local data element offered to the peer for a key or filter.
#[derive(Clone, Debug, PartialEq)]
pub struct ElementData {
    pub id: i64,
    pub config: ElementConfig,
    /// Last sample id received per remote element id.
    pub last_ids: HashMap<i64, i64>,
}

/// Local key/filter matching one of the peer's announced keys/filters.
#[derive(Clone, Debug, PartialEq)]
pub struct ElementSpec {
    pub elements: Vec<ElementData>,
    pub id: i64,
    pub name: String,
    pub value: Vec<u8>,
    /// Peer key/filter id this spec matched.
    pub peer_id: i64,
    pub peer_name: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ElementDataAck {
    pub id: i64,
    pub config: ElementConfig,
    pub last_ids: HashMap<i64, i64>,
    /// Initial samples when the acknowledging side is the writer.
    pub samples: Vec<DataSample>,
    /// Peer data element id.
    pub peer_id: i64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ElementSpecAck {
    pub elements: Vec<ElementDataAck>,
    pub id: i64,
    pub name: String,
    pub value: Vec<u8>,
    pub peer_id: i64,
    pub peer_name: String,
}

/// Data-only reference to a node.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NodeRef {
    pub name: String,
    /// Directly dialable endpoint, if the node has one.
    pub endpoint: Option<String>,
    /// Endpoint of a node relaying for this one.
    pub relay: Option<String>,
}

impl NodeRef {
    pub fn new(name: impl Into<String>, endpoint: Option<String>) -> Self {
        Self {
            name: name.into(),
            endpoint,
            relay: None,
        }
    }

    /// Whether the node can be dialed without going through a relay or an
    /// existing connection.
    pub fn is_dialable(&self) -> bool {
        self.endpoint.is_some()
    }
}

/// Data-only reference to a session servant of a node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionRef {
    pub node: NodeRef,
    pub facet: String,
}

/// Discovery requests, addressed to a node's lookup servant.
#[derive(Clone, Debug)]
pub enum LookupRequest {
    AnnounceTopicReader { name: String, node: NodeRef },
    AnnounceTopicWriter { name: String, node: NodeRef },
    AnnounceTopics {
        readers: Vec<String>,
        writers: Vec<String>,
        node: NodeRef,
    },
    /// Two-way; replied with [`Response::Node`].
    CreateSession { node: NodeRef },
}

/// Session handshake requests, addressed to a node servant.
#[derive(Clone, Debug)]
pub enum NodeRequest {
    InitiateCreateSession {
        publisher: NodeRef,
    },
    CreateSession {
        subscriber: NodeRef,
        subscriber_session: SessionRef,
        from_relay: bool,
    },
    ConfirmCreateSession {
        publisher: NodeRef,
        publisher_session: SessionRef,
    },
}

/// Data protocol requests, addressed to a session servant facet.
#[derive(Clone, Debug)]
pub enum SessionRequest {
    AnnounceTopics {
        topics: Vec<TopicInfo>,
        initialize: bool,
    },
    AttachTopic(TopicSpec),
    DetachTopic(i64),
    AttachTags {
        topic: i64,
        tags: Vec<ElementInfo>,
        initialize: bool,
    },
    DetachTags {
        topic: i64,
        tags: Vec<i64>,
    },
    AnnounceElements {
        topic: i64,
        elements: Vec<ElementInfo>,
    },
    AttachElements {
        topic: i64,
        elements: Vec<ElementSpec>,
        initialize: bool,
    },
    AttachElementsAck {
        topic: i64,
        elements: Vec<ElementSpecAck>,
    },
    /// Detach the data element `element` from the keys/filters `elements`.
    DetachElements {
        topic: i64,
        elements: Vec<i64>,
        element: i64,
    },
    InitSamples {
        topic: i64,
        samples: Vec<DataSamples>,
    },
    Disconnected,
    /// Live sample push (`s()`), only sent to subscriber sessions.
    Sample {
        topic: i64,
        element: i64,
        origin: i64,
        sample: DataSample,
    },
}

impl SessionRequest {
    pub fn name(&self) -> &'static str {
        match self {
            SessionRequest::AnnounceTopics { .. } => "announceTopics",
            SessionRequest::AttachTopic(_) => "attachTopic",
            SessionRequest::DetachTopic(_) => "detachTopic",
            SessionRequest::AttachTags { .. } => "attachTags",
            SessionRequest::DetachTags { .. } => "detachTags",
            SessionRequest::AnnounceElements { .. } => "announceElements",
            SessionRequest::AttachElements { .. } => "attachElements",
            SessionRequest::AttachElementsAck { .. } => "attachElementsAck",
            SessionRequest::DetachElements { .. } => "detachElements",
            SessionRequest::InitSamples { .. } => "initSamples",
            SessionRequest::Disconnected => "disconnected",
            SessionRequest::Sample { .. } => "s",
        }
    }
}

#[derive(Clone, Debug)]
pub enum Request {
    Lookup(LookupRequest),
    Node(NodeRequest),
    Session(SessionRequest),
}

impl Request {
    /// Apply `f` to every [`NodeRef`] carried by the request.
    pub fn for_each_node_ref(&mut self, mut f: impl FnMut(&mut NodeRef)) {
        match self {
            Request::Lookup(LookupRequest::AnnounceTopicReader { node, .. })
            | Request::Lookup(LookupRequest::AnnounceTopicWriter { node, .. })
            | Request::Lookup(LookupRequest::AnnounceTopics { node, .. })
            | Request::Lookup(LookupRequest::CreateSession { node }) => f(node),
            Request::Node(NodeRequest::InitiateCreateSession { publisher }) => f(publisher),
            Request::Node(NodeRequest::CreateSession {
                subscriber,
                subscriber_session,
                ..
            }) => {
                f(subscriber);
                f(&mut subscriber_session.node);
            }
            Request::Node(NodeRequest::ConfirmCreateSession {
                publisher,
                publisher_session,
            }) => {
                f(publisher);
                f(&mut publisher_session.node);
            }
            Request::Session(_) => {}
        }
    }
}

/// Successful reply to a two-way request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    Done,
    Node(NodeRef),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clear_history_policy_matrix() {
        use ClearHistoryPolicy::*;
        use SampleEvent::*;

        assert!(OnAdd.clears_on(Add));
        assert!(!OnAdd.clears_on(Update));
        assert!(OnRemove.clears_on(Remove));
        assert!(!OnRemove.clears_on(Add));
        assert!(OnAll.clears_on(PartialUpdate));
        assert!(OnAllExceptPartialUpdate.clears_on(Update));
        assert!(!OnAllExceptPartialUpdate.clears_on(PartialUpdate));
        assert!(!Never.clears_on(Add));
    }

    #[test]
    fn test_element_config_merge_prefers_own_values() {
        let defaults = ElementConfig {
            sample_count: Some(10),
            priority: Some(1),
            clear_history: Some(ClearHistoryPolicy::OnAll),
            ..Default::default()
        };
        let own = ElementConfig {
            sample_count: Some(3),
            ..Default::default()
        };

        let merged = own.merged(&defaults);
        assert_eq!(merged.sample_count, Some(3));
        assert_eq!(merged.priority, Some(1));
        assert_eq!(merged.clear_history, Some(ClearHistoryPolicy::OnAll));
        assert_eq!(merged.discard_policy, None);
    }

    #[test]
    fn test_rewrite_node_refs_in_handshake() {
        let node = NodeRef::new("a", None);
        let mut request = Request::Node(NodeRequest::CreateSession {
            subscriber: node.clone(),
            subscriber_session: SessionRef {
                node,
                facet: "s/1".into(),
            },
            from_relay: false,
        });

        request.for_each_node_ref(|n| n.relay = Some("relay".into()));

        match request {
            Request::Node(NodeRequest::CreateSession {
                subscriber,
                subscriber_session,
                ..
            }) => {
                assert_eq!(subscriber.relay.as_deref(), Some("relay"));
                assert_eq!(subscriber_session.node.relay.as_deref(), Some("relay"));
            }
            _ => panic!("unexpected request"),
        }
    }
}
