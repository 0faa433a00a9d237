// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-session subscription tables and the attach/detach protocol.
//!
//! # Attach flow (per remote topic)
//!
//! ```text
//!  A (has spec of B's keys/filters)        B
//!  element_specs(B infos) ---- attachElements ---->  attach_elements()
//!                                                   (attach local elements,
//!                                                    writers replay history)
//!  attach_elements_ack() <--- attachElementsAck ---
//!   writer: send initSamples
//!   reader: PendingInit, run once the whole batch attached
//! ```
//!
//! Table entries carry the session instance id they were (re)established
//! under. Entries left over from a previous connection and not re-attached
//! are reaped when the peer sends its initializing announcements.

use super::{TopicCore, TopicState};
use crate::core::barrier;
use crate::core::element::history::{to_wire, ReplayRequest};
use crate::core::element::{DataElement, RemoteElement, SubscriberId};
use crate::core::interner::{FilterRef, KeyRef, TagRef, ValueFactory};
use crate::core::sample::now_micros;
use crate::core::session::Session;
use crate::protocol::{
    DataSample, DataSamples, ElementConfig, ElementData, ElementDataAck, ElementInfo, ElementSpec,
    ElementSpecAck, SessionRequest,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

pub(super) struct AttachedSession {
    pub(super) session: Arc<Session>,
    pub(super) topics: HashMap<i64, RemoteTopic>,
}

impl AttachedSession {
    pub(super) fn forget_local_element(&mut self, id: i64) {
        for topic in self.topics.values_mut() {
            for subscribers in topic.elements.values_mut() {
                subscribers.subscribers.retain(|(local, _), _| *local != id);
            }
        }
    }
}

/// Subscription state for one remote topic.
pub(super) struct RemoteTopic {
    instance: u64,
    /// Counted in the topic's listener count.
    pub(super) attached: bool,
    /// Remote tag id -> local tag.
    tags: HashMap<i64, TagRef>,
    /// Remote key id (> 0) or negated filter id (< 0) -> subscribers.
    elements: HashMap<i64, ElementSubscribers>,
}

struct ElementSubscribers {
    instance: u64,
    /// Remote key, when attached through a remote key.
    key: Option<KeyRef>,
    /// Decoded keys of samples received through a remote filter.
    keys: HashMap<i64, KeyRef>,
    subscribers: HashMap<(i64, i64), ElementSubscriber>,
}

impl ElementSubscribers {
    fn resolve_key(&mut self, factory: &ValueFactory, sample: &DataSample) -> Option<KeyRef> {
        if let Some(key) = &self.key {
            return Some(key.clone());
        }
        if let Some(key) = self.keys.get(&sample.key_id) {
            return Some(key.clone());
        }
        if sample.key_value.is_empty() {
            log::debug!("[TOPIC] sample {} without key value", sample.id);
            return None;
        }
        match factory.decode(&sample.key_value) {
            Ok(key) => {
                self.keys.insert(sample.key_id, key.clone());
                Some(key)
            }
            Err(e) => {
                log::debug!("[TOPIC] undecodable key on sample {}: {}", sample.id, e);
                None
            }
        }
    }
}

/// Attachment of one local element to one remote element.
struct ElementSubscriber {
    instance: u64,
    initialized: bool,
    last_id: i64,
    /// Local keys constraining delivery; empty delivers every key.
    keys: BTreeSet<KeyRef>,
    name: Arc<str>,
    priority: i32,
}

/// Writer samples a local reader is initialized with once the whole
/// acknowledgement batch has attached.
pub(crate) struct PendingInit {
    pub(crate) remote_topic: i64,
    pub(crate) samples: DataSamples,
}

/// Local side of an attachment: one of our keys or filters.
struct LocalSide {
    key: Option<KeyRef>,
    info: ElementInfo,
    elements: Vec<i64>,
}

/// Remote side of an attachment.
struct RemoteSide {
    id: i64,
    key: Option<KeyRef>,
    filter: Option<FilterRef>,
}

/// Remote element taking part in an attachment.
struct RemoteData<'a> {
    id: i64,
    config: &'a ElementConfig,
    last_ids: &'a HashMap<i64, i64>,
}

/// Result of attaching one local element to one remote element.
struct Attached {
    last_id: i64,
    config: ElementConfig,
    is_reader: bool,
    samples: Vec<DataSample>,
}

impl TopicCore {
    // ========================================================================
    // Remote topics
    // ========================================================================

    /// Attach the remote topic `remote_topic` of `session`.
    pub(crate) fn attach_session(&self, session: &Arc<Session>, remote_topic: i64, instance: u64) {
        let mut state = self.state.lock();
        if state.destroyed {
            return;
        }
        let attached = state
            .sessions
            .entry(session.id().clone())
            .or_insert_with(|| AttachedSession {
                session: session.clone(),
                topics: HashMap::new(),
            });
        if !Arc::ptr_eq(&attached.session, session) {
            attached.session = session.clone();
        }
        let topic = attached
            .topics
            .entry(remote_topic)
            .or_insert_with(|| RemoteTopic {
                instance,
                attached: false,
                tags: HashMap::new(),
                elements: HashMap::new(),
            });
        topic.instance = instance;
        let newly = !topic.attached;
        topic.attached = true;
        if newly {
            state.listener_count += 1;
            log::debug!(
                "[TOPIC] {}: attached remote topic {} of {}",
                self.shared.name,
                remote_topic,
                session.id()
            );
            barrier::notify(&mut state, &self.cond);
        }
    }

    /// Remote topics of `session` attached to this topic.
    pub(crate) fn remote_topics(&self, session: &str) -> Vec<i64> {
        let state = self.state.lock();
        state
            .sessions
            .get(session)
            .map(|a| a.topics.keys().copied().collect())
            .unwrap_or_default()
    }

    pub(crate) fn detach_remote_topic(&self, session: &str, remote_topic: i64) {
        let mut state = self.state.lock();
        let Some(attached) = state.sessions.get_mut(session) else {
            return;
        };
        let Some(topic) = attached.topics.remove(&remote_topic) else {
            return;
        };
        if attached.topics.is_empty() {
            state.sessions.remove(session);
        }
        if topic.attached {
            state.listener_count -= 1;
        }
        for element in state.elements.values_mut() {
            element.detach_where(|id| &*id.session == session && id.topic == remote_topic);
        }
        log::debug!(
            "[TOPIC] {}: detached remote topic {} of {}",
            self.shared.name,
            remote_topic,
            session
        );
        barrier::notify(&mut state, &self.cond);
    }

    /// Connection lost: detach every listener of `session` but keep the
    /// tables so the next connection resumes from the last seen ids.
    pub(crate) fn detach_session(&self, session: &str) {
        let mut state = self.state.lock();
        let mut detached = 0;
        if let Some(attached) = state.sessions.get_mut(session) {
            for topic in attached.topics.values_mut() {
                if std::mem::take(&mut topic.attached) {
                    detached += 1;
                }
                for subscribers in topic.elements.values_mut() {
                    for subscriber in subscribers.subscribers.values_mut() {
                        subscriber.initialized = false;
                    }
                }
            }
        }
        state.listener_count -= detached;
        for element in state.elements.values_mut() {
            element.detach_where(|id| &*id.session == session);
        }
        barrier::notify(&mut state, &self.cond);
    }

    /// Session destroyed: detach and drop its tables.
    pub(crate) fn remove_session(&self, session: &str) {
        self.detach_session(session);
        self.state.lock().sessions.remove(session);
    }

    /// Drop remote topics not re-attached under `instance`.
    pub(crate) fn reap_topics(&self, session: &str, instance: u64) {
        let mut state = self.state.lock();
        let Some(attached) = state.sessions.get_mut(session) else {
            return;
        };
        let stale: Vec<i64> = attached
            .topics
            .iter()
            .filter(|(_, t)| t.instance != instance)
            .map(|(id, _)| *id)
            .collect();
        if stale.is_empty() {
            return;
        }
        let mut detached = 0;
        for id in &stale {
            if attached.topics.remove(id).is_some_and(|t| t.attached) {
                detached += 1;
            }
        }
        state.listener_count -= detached;
        for element in state.elements.values_mut() {
            element.detach_where(|id| &*id.session == session && stale.contains(&id.topic));
        }
        log::debug!(
            "[TOPIC] {}: reaped {} stale remote topic(s) of {}",
            self.shared.name,
            stale.len(),
            session
        );
        barrier::notify(&mut state, &self.cond);
    }

    // ========================================================================
    // Tags
    // ========================================================================

    pub(crate) fn attach_tags(
        &self,
        session: &str,
        remote_topic: i64,
        tags: &[ElementInfo],
        initialize: bool,
    ) {
        let mut state = self.state.lock();
        let Some(topic) = remote_topic_mut(&mut state, session, remote_topic) else {
            return;
        };
        if initialize {
            topic.tags.clear();
        }
        for info in tags {
            match self.shared.tags.decode(&info.value) {
                Ok(tag) => {
                    topic.tags.insert(info.id, tag);
                }
                Err(e) => log::debug!("[TOPIC] {}: dropping tag {}: {}", self.shared.name, info.id, e),
            }
        }
    }

    pub(crate) fn detach_tags(&self, session: &str, remote_topic: i64, tags: &[i64]) {
        let mut state = self.state.lock();
        if let Some(topic) = remote_topic_mut(&mut state, session, remote_topic) {
            for id in tags {
                topic.tags.remove(id);
            }
        }
    }

    // ========================================================================
    // Element matching
    // ========================================================================

    /// Specs of the local keys/filters matching the remote `infos`.
    pub(crate) fn element_specs(
        &self,
        session: &str,
        remote_topic: i64,
        infos: &[ElementInfo],
    ) -> Vec<ElementSpec> {
        let state = self.state.lock();
        if state.destroyed {
            return Vec::new();
        }
        let topic = state
            .sessions
            .get(session)
            .and_then(|a| a.topics.get(&remote_topic));

        let mut specs = Vec::new();
        for info in infos {
            let mut matches: Vec<(ElementInfo, &BTreeSet<i64>)> = Vec::new();
            if info.id > 0 {
                let key = match self.shared.keys.decode(&info.value) {
                    Ok(key) => key,
                    Err(e) => {
                        log::debug!("[TOPIC] {}: dropping key {}: {}", self.shared.name, info.id, e);
                        continue;
                    }
                };
                if let Some(ids) = state.keyed.get(&key) {
                    matches.push((key_info(&key), ids));
                }
                for (filter, ids) in &state.filtered {
                    if filter.matches_key(&key) {
                        matches.push((crate::core::element::filter_info(filter), ids));
                    }
                }
            } else {
                let filter = match self.shared.key_filters.create(&info.name, &info.value) {
                    Ok(filter) => filter,
                    Err(e) => {
                        log::debug!("[TOPIC] {}: dropping filter {}: {}", self.shared.name, info.id, e);
                        continue;
                    }
                };
                for (key, ids) in &state.keyed {
                    if filter.matches_key(key) {
                        matches.push((key_info(key), ids));
                    }
                }
                for (local, ids) in &state.filtered {
                    if local.matches_filter(&filter) {
                        matches.push((crate::core::element::filter_info(local), ids));
                    }
                }
            }

            for (local, ids) in matches {
                let elements = ids
                    .iter()
                    .filter_map(|id| state.elements.get(id))
                    .map(|element| ElementData {
                        id: element.id,
                        config: element.config.clone(),
                        last_ids: topic
                            .map(|t| last_ids(t, info.id, element.id))
                            .unwrap_or_default(),
                    })
                    .collect();
                specs.push(ElementSpec {
                    elements,
                    id: local.id,
                    name: local.name,
                    value: local.value,
                    peer_id: info.id,
                    peer_name: info.name.clone(),
                });
            }
        }
        specs
    }

    /// Attach the local elements named by each spec to the remote elements
    /// it lists and acknowledge.
    pub(crate) fn attach_elements(
        &self,
        session: &Arc<Session>,
        remote_topic: i64,
        specs: &[ElementSpec],
        initialize: bool,
        instance: u64,
    ) {
        let mut state = self.state.lock();
        if state.destroyed {
            return;
        }
        let now = now_micros();
        let mut acks = Vec::new();
        for spec in specs {
            let Some(local) = self.local_side(&state, spec.peer_id) else {
                continue;
            };
            let Some(remote) = self.remote_side(spec.id, &spec.name, &spec.value) else {
                continue;
            };
            let mut elements = Vec::new();
            for data in &spec.elements {
                let data = RemoteData {
                    id: data.id,
                    config: &data.config,
                    last_ids: &data.last_ids,
                };
                for &local_id in &local.elements {
                    let Some(attached) = self.attach_pair(
                        &mut state, session.id(), remote_topic, instance, local_id, &local, &remote, &data, now,
                    ) else {
                        continue;
                    };
                    let last_ids = if attached.is_reader {
                        HashMap::from([(data.id, attached.last_id)])
                    } else {
                        HashMap::new()
                    };
                    elements.push(ElementDataAck {
                        id: local_id,
                        config: attached.config,
                        last_ids,
                        samples: attached.samples,
                        peer_id: data.id,
                    });
                }
            }
            if !elements.is_empty() {
                acks.push(ElementSpecAck {
                    elements,
                    id: local.info.id,
                    name: local.info.name,
                    value: local.info.value,
                    peer_id: spec.id,
                    peer_name: spec.name.clone(),
                });
            }
        }
        if !acks.is_empty() {
            session.send(SessionRequest::AttachElementsAck {
                topic: self.id,
                elements: acks,
            });
        }
        if initialize {
            if let Some(topic) = remote_topic_mut(&mut state, session.id(), remote_topic) {
                topic.elements.retain(|_, subscribers| {
                    subscribers
                        .subscribers
                        .retain(|_, subscriber| subscriber.instance == instance);
                    subscribers.instance == instance
                });
            }
        }
        barrier::notify(&mut state, &self.cond);
    }

    /// Finish the attachments acknowledged by the peer. Writers send their
    /// history right away; reader initializations are returned.
    pub(crate) fn attach_elements_ack(
        &self,
        session: &Arc<Session>,
        remote_topic: i64,
        acks: &[ElementSpecAck],
        instance: u64,
    ) -> Vec<PendingInit> {
        let mut state = self.state.lock();
        if state.destroyed {
            return Vec::new();
        }
        let now = now_micros();
        let mut pending = Vec::new();
        let mut init = Vec::new();
        for ack in acks {
            let Some(local) = self.local_side(&state, ack.peer_id) else {
                continue;
            };
            let Some(remote) = self.remote_side(ack.id, &ack.name, &ack.value) else {
                continue;
            };
            for data in &ack.elements {
                if !local.elements.contains(&data.peer_id) {
                    continue;
                }
                let remote_data = RemoteData {
                    id: data.id,
                    config: &data.config,
                    last_ids: &data.last_ids,
                };
                let Some(attached) = self.attach_pair(
                    &mut state, session.id(), remote_topic, instance, data.peer_id, &local, &remote,
                    &remote_data, now,
                ) else {
                    continue;
                };
                if attached.is_reader {
                    pending.push(PendingInit {
                        remote_topic,
                        samples: DataSamples {
                            id: ack.id,
                            origin: data.id,
                            peer: data.peer_id,
                            samples: data.samples.clone(),
                        },
                    });
                } else {
                    init.push(DataSamples {
                        id: ack.peer_id,
                        origin: data.peer_id,
                        peer: data.id,
                        samples: attached.samples,
                    });
                }
            }
        }
        if !init.is_empty() {
            session.send(SessionRequest::InitSamples {
                topic: self.id,
                samples: init,
            });
        }
        barrier::notify(&mut state, &self.cond);
        pending
    }

    fn local_side(&self, state: &TopicState, id: i64) -> Option<LocalSide> {
        if id > 0 {
            let key = self.shared.keys.get(id)?;
            let elements = state.keyed.get(&key)?.iter().copied().collect();
            Some(LocalSide {
                info: key_info(&key),
                key: Some(key),
                elements,
            })
        } else {
            let filter = self.shared.key_filters.get(-id)?;
            let elements = state.filtered.get(&filter)?.iter().copied().collect();
            Some(LocalSide {
                info: crate::core::element::filter_info(&filter),
                key: None,
                elements,
            })
        }
    }

    fn remote_side(&self, id: i64, name: &str, value: &[u8]) -> Option<RemoteSide> {
        if id > 0 {
            match self.shared.keys.decode(value) {
                Ok(key) => Some(RemoteSide {
                    id,
                    key: Some(key),
                    filter: None,
                }),
                Err(e) => {
                    log::debug!("[TOPIC] {}: dropping remote key {}: {}", self.shared.name, id, e);
                    None
                }
            }
        } else {
            match self.shared.key_filters.create(name, value) {
                Ok(filter) => Some(RemoteSide {
                    id,
                    key: None,
                    filter: Some(filter),
                }),
                Err(e) => {
                    log::debug!("[TOPIC] {}: dropping remote filter {}: {}", self.shared.name, id, e);
                    None
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn attach_pair(
        &self,
        state: &mut TopicState,
        session: &Arc<str>,
        remote_topic: i64,
        instance: u64,
        local_id: i64,
        local: &LocalSide,
        remote: &RemoteSide,
        data: &RemoteData<'_>,
        now: i64,
    ) -> Option<Attached> {
        let TopicState {
            sessions, elements, ..
        } = state;
        let element = elements.get_mut(&local_id)?;
        let topic = sessions.get_mut(session)?.topics.get_mut(&remote_topic)?;

        let sample_filter = match &data.config.sample_filter {
            Some(filter) if !element.is_reader() => {
                match self.shared.sample_filters.create(&filter.name, &filter.criteria) {
                    Ok(filter) => Some(filter),
                    Err(e) => {
                        log::debug!(
                            "[TOPIC] {}: cannot attach {}: {}",
                            self.shared.name,
                            data.id,
                            e
                        );
                        return None;
                    }
                }
            }
            _ => None,
        };
        let name: Arc<str> = match &data.config.name {
            Some(name) => Arc::from(name.as_str()),
            None => Arc::from(data.id.to_string()),
        };
        let priority = data
            .config
            .priority
            .unwrap_or(crate::config::DEFAULT_PRIORITY);

        let subscribers = topic
            .elements
            .entry(remote.id)
            .or_insert_with(|| ElementSubscribers {
                instance,
                key: remote.key.clone(),
                keys: HashMap::new(),
                subscribers: HashMap::new(),
            });
        subscribers.instance = instance;
        let subscriber = subscribers
            .subscribers
            .entry((local_id, data.id))
            .or_insert_with(|| ElementSubscriber {
                instance,
                initialized: false,
                last_id: 0,
                keys: BTreeSet::new(),
                name: name.clone(),
                priority,
            });
        subscriber.instance = instance;
        subscriber.name = name.clone();
        subscriber.priority = priority;
        if let Some(key) = &local.key {
            subscriber.keys.insert(key.clone());
        }
        if !element.is_reader() {
            subscriber.initialized = true;
        }
        let last_id = subscriber.last_id;

        let key = local.key.clone().or_else(|| remote.key.clone());
        element.attach(
            SubscriberId {
                session: session.clone(),
                topic: remote_topic,
                element: data.id,
            },
            key.clone(),
            RemoteElement {
                filter: remote.filter.clone(),
                sample_filter: sample_filter.clone(),
                name,
                priority,
                config: data.config.clone(),
            },
        );

        let samples = if element.is_reader() {
            Vec::new()
        } else {
            let request = ReplayRequest {
                key: key.as_ref(),
                key_filter: if key.is_none() {
                    remote.filter.as_ref()
                } else {
                    None
                },
                sample_filter: sample_filter.as_ref(),
                peer: data.config,
                last_id: data.last_ids.get(&local_id).copied().unwrap_or(0),
                now,
            };
            let replay = element.history.replay(&request);
            to_wire(&replay, local.key.is_none(), self.shared.values.as_ref())
        };
        Some(Attached {
            last_id,
            config: element.config.clone(),
            is_reader: element.is_reader(),
            samples,
        })
    }

    // ========================================================================
    // Samples
    // ========================================================================

    /// Initialize a reader's subscriber with a writer's history.
    pub(crate) fn init_samples(&self, session: &Arc<str>, remote_topic: i64, samples: &DataSamples) {
        let mut state = self.state.lock();
        if state.destroyed {
            return;
        }
        let now = now_micros();
        let queued = {
            let TopicState {
                sessions, elements, ..
            } = &mut *state;
            let Some(topic) = sessions
                .get_mut(&**session)
                .and_then(|a| a.topics.get_mut(&remote_topic))
            else {
                return;
            };
            let tags = &topic.tags;
            let Some(subscribers) = topic.elements.get_mut(&samples.id) else {
                return;
            };
            let key_factory = &self.shared.keys;
            let mut resolved = Vec::with_capacity(samples.samples.len());
            for data in &samples.samples {
                if let Some(key) = subscribers.resolve_key(key_factory, data) {
                    resolved.push((data, key));
                }
            }
            let Some(subscriber) = subscribers.subscribers.get_mut(&(samples.peer, samples.origin))
            else {
                return;
            };
            subscriber.initialized = true;
            let mut queued = false;
            for (data, key) in resolved {
                let tag = tag_for(tags, data);
                queued |= self.deliver_to(elements, samples.peer, subscriber, data, key, tag, session, now);
            }
            queued
        };
        log::trace!(
            "[TOPIC] {}: initialized reader {} from writer {} ({} samples)",
            self.shared.name,
            samples.peer,
            samples.origin,
            samples.samples.len()
        );
        if queued {
            barrier::notify(&mut state, &self.cond);
        }
    }

    /// Live sample from writer `origin`, sent under the writer's key or
    /// filter id `attach`.
    pub(crate) fn deliver(
        &self,
        session: &Arc<str>,
        remote_topic: i64,
        attach: i64,
        origin: i64,
        data: &DataSample,
    ) {
        let mut state = self.state.lock();
        if state.destroyed {
            return;
        }
        let now = now_micros();
        let queued = {
            let TopicState {
                sessions, elements, ..
            } = &mut *state;
            let Some(topic) = sessions
                .get_mut(&**session)
                .and_then(|a| a.topics.get_mut(&remote_topic))
            else {
                return;
            };
            let tag = tag_for(&topic.tags, data);
            let Some(subscribers) = topic.elements.get_mut(&attach) else {
                return;
            };
            let Some(key) = subscribers.resolve_key(&self.shared.keys, data) else {
                return;
            };
            let mut queued = false;
            for (&(local, remote), subscriber) in subscribers.subscribers.iter_mut() {
                if remote != origin || !subscriber.initialized {
                    continue;
                }
                queued |= self.deliver_to(
                    elements,
                    local,
                    subscriber,
                    data,
                    key.clone(),
                    tag.clone(),
                    session,
                    now,
                );
            }
            queued
        };
        if queued {
            barrier::notify(&mut state, &self.cond);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn deliver_to(
        &self,
        elements: &mut BTreeMap<i64, DataElement>,
        local: i64,
        subscriber: &mut ElementSubscriber,
        data: &DataSample,
        key: KeyRef,
        tag: Option<TagRef>,
        session: &Arc<str>,
        now: i64,
    ) -> bool {
        if data.id <= subscriber.last_id {
            return false;
        }
        subscriber.last_id = data.id;
        if !subscriber.keys.is_empty() && !subscriber.keys.contains(&key) {
            return false;
        }
        let Some(element) = elements.get_mut(&local) else {
            return false;
        };
        let Some(sample) = self.received_sample(
            element,
            data,
            Some(key),
            tag,
            subscriber.name.clone(),
            session.clone(),
        ) else {
            return false;
        };
        element.queue(sample, subscriber.priority, now)
    }

    /// The remote element `element` was destroyed.
    pub(crate) fn detach_elements(
        &self,
        session: &str,
        remote_topic: i64,
        attach_ids: &[i64],
        element: i64,
    ) {
        let mut state = self.state.lock();
        if let Some(topic) = remote_topic_mut(&mut state, session, remote_topic) {
            for attach in attach_ids {
                if let Some(subscribers) = topic.elements.get_mut(attach) {
                    subscribers.subscribers.retain(|(_, remote), _| *remote != element);
                    if subscribers.subscribers.is_empty() {
                        topic.elements.remove(attach);
                    }
                }
            }
        }
        for local in state.elements.values_mut() {
            local.detach_where(|id| {
                &*id.session == session && id.topic == remote_topic && id.element == element
            });
        }
        barrier::notify(&mut state, &self.cond);
    }
}

fn remote_topic_mut<'a>(
    state: &'a mut TopicState,
    session: &str,
    remote_topic: i64,
) -> Option<&'a mut RemoteTopic> {
    state
        .sessions
        .get_mut(session)
        .and_then(|a| a.topics.get_mut(&remote_topic))
}

fn key_info(key: &KeyRef) -> ElementInfo {
    ElementInfo {
        id: key.id(),
        name: String::new(),
        value: key.encoded().to_vec(),
    }
}

fn tag_for(tags: &HashMap<i64, TagRef>, data: &DataSample) -> Option<TagRef> {
    (data.tag != 0).then(|| tags.get(&data.tag).cloned()).flatten()
}

/// Last sample id received by local element `local` from each remote
/// element attached through `attach`.
fn last_ids(topic: &RemoteTopic, attach: i64, local: i64) -> HashMap<i64, i64> {
    topic
        .elements
        .get(&attach)
        .map(|subscribers| {
            subscribers
                .subscribers
                .iter()
                .filter(|((l, _), _)| *l == local)
                .map(|((_, remote), s)| (*remote, s.last_id))
                .collect()
        })
        .unwrap_or_default()
}
