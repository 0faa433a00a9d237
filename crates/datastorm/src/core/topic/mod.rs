// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reader and writer topics.
//!
//! A [`TopicCore`] owns the data elements of one role (readers or writers)
//! for one topic name, the key and filter indexes used to match remote
//! announcements, and the per-session subscription tables.
//!
//! ```text
//! TopicCore (one mutex + condvar)
//! +-- elements:  id -> DataElement
//! +-- keyed:     key -> {element id}
//! +-- filtered:  filter -> {element id}
//! +-- sessions:  session id -> AttachedSession
//!                 +-- remote topic id -> RemoteTopic
//!                      +-- remote key/filter id -> ElementSubscribers
//!                           +-- (local, remote element) -> ElementSubscriber
//! ```
//!
//! # Locking
//!
//! The topic mutex guards the elements too. Session code calls into a topic
//! while holding its own lock; topic code never takes a session lock, it only
//! sends through the session's lock-free peer proxy.

pub(crate) mod factory;
mod subscriptions;

use crate::api::{Error, Result};
use crate::core::barrier::{self, HasBarrier, NotifyBarrier};
use crate::core::element::{Binding, DataElement, ElementKind};
use crate::core::executor::CallbackExecutor;
use crate::core::interner::{
    AnyValue, FilterFactory, FilterRef, KeyRef, TagRef, ValueCodec, ValueFactory,
};
use crate::core::sample::{now_micros, Sample};
use crate::core::session::Session;
use crate::protocol::{ElementConfig, ElementInfo, SampleEvent, SessionRequest, TopicInfo, TopicSpec};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

pub(crate) use subscriptions::PendingInit;
use subscriptions::AttachedSession;

static TOPIC_IDS: AtomicI64 = AtomicI64::new(0);

/// Applies an encoded partial update to the current value (`None` when the
/// key has no value yet).
pub(crate) type Updater =
    Arc<dyn Fn(Option<&AnyValue>, &[u8]) -> std::result::Result<AnyValue, crate::api::CodecError> + Send + Sync>;

/// State shared by the reader and writer topics of one typed topic.
pub(crate) struct TopicShared {
    pub(crate) name: Arc<str>,
    pub(crate) keys: ValueFactory,
    pub(crate) tags: ValueFactory,
    pub(crate) key_filters: FilterFactory,
    pub(crate) sample_filters: FilterFactory,
    pub(crate) values: Arc<dyn ValueCodec>,
    updaters: RwLock<HashMap<i64, (TagRef, Updater)>>,
    reader_defaults: RwLock<ElementConfig>,
    writer_defaults: RwLock<ElementConfig>,
}

impl TopicShared {
    pub(crate) fn new(
        name: &str,
        keys: ValueFactory,
        tags: ValueFactory,
        values: Arc<dyn ValueCodec>,
        reader_defaults: ElementConfig,
        writer_defaults: ElementConfig,
    ) -> Self {
        Self {
            name: Arc::from(name),
            keys,
            tags,
            key_filters: FilterFactory::key_filters(),
            sample_filters: FilterFactory::sample_filters(),
            values,
            updaters: RwLock::new(HashMap::new()),
            reader_defaults: RwLock::new(reader_defaults),
            writer_defaults: RwLock::new(writer_defaults),
        }
    }

    pub(crate) fn set_updater(&self, tag: TagRef, updater: Updater) {
        self.updaters.write().insert(tag.id(), (tag, updater));
    }

    pub(crate) fn updater(&self, tag: i64) -> Option<Updater> {
        self.updaters.read().get(&tag).map(|(_, u)| u.clone())
    }

    pub(crate) fn tag_infos(&self) -> Vec<ElementInfo> {
        self.updaters
            .read()
            .values()
            .map(|(tag, _)| ElementInfo {
                id: tag.id(),
                name: String::new(),
                value: tag.encoded().to_vec(),
            })
            .collect()
    }

    /// Overlay `config` on the current defaults for `kind`.
    pub(crate) fn set_defaults(&self, kind: ElementKind, config: &ElementConfig) {
        let defaults = match kind {
            ElementKind::Reader => &self.reader_defaults,
            ElementKind::Writer => &self.writer_defaults,
        };
        let mut defaults = defaults.write();
        *defaults = config.merged(&defaults);
    }

    pub(crate) fn defaults(&self, kind: ElementKind) -> ElementConfig {
        match kind {
            ElementKind::Reader => self.reader_defaults.read().clone(),
            ElementKind::Writer => self.writer_defaults.read().clone(),
        }
    }

    /// Apply the update registered for `tag` to `baseline`.
    pub(crate) fn apply_update(
        &self,
        tag: &TagRef,
        baseline: Option<&AnyValue>,
        update: &[u8],
    ) -> Option<AnyValue> {
        let Some(updater) = self.updater(tag.id()) else {
            log::debug!("[TOPIC] {}: no updater for {:?}", self.name, tag);
            return None;
        };
        match updater(baseline, update) {
            Ok(value) => Some(value),
            Err(e) => {
                log::debug!("[TOPIC] {}: partial update failed: {}", self.name, e);
                None
            }
        }
    }
}

pub(crate) struct TopicState {
    elements: BTreeMap<i64, DataElement>,
    keyed: HashMap<KeyRef, BTreeSet<i64>>,
    filtered: HashMap<FilterRef, BTreeSet<i64>>,
    sessions: HashMap<Arc<str>, AttachedSession>,
    /// Attached (session, remote topic) pairs.
    listener_count: usize,
    next_element_id: i64,
    next_sample_id: i64,
    last_timestamp: i64,
    destroyed: bool,
    barrier: NotifyBarrier,
}

impl HasBarrier for TopicState {
    fn barrier(&mut self) -> &mut NotifyBarrier {
        &mut self.barrier
    }
}

pub(crate) struct TopicCore {
    pub(crate) id: i64,
    pub(crate) kind: ElementKind,
    pub(crate) shared: Arc<TopicShared>,
    node_name: Arc<str>,
    executor: Arc<CallbackExecutor>,
    shutdown: Arc<AtomicBool>,
    state: Mutex<TopicState>,
    cond: Condvar,
}

impl TopicCore {
    pub(crate) fn new(
        kind: ElementKind,
        shared: Arc<TopicShared>,
        node_name: Arc<str>,
        executor: Arc<CallbackExecutor>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            id: TOPIC_IDS.fetch_add(1, Ordering::Relaxed) + 1,
            kind,
            shared,
            node_name,
            executor,
            shutdown,
            state: Mutex::new(TopicState {
                elements: BTreeMap::new(),
                keyed: HashMap::new(),
                filtered: HashMap::new(),
                sessions: HashMap::new(),
                listener_count: 0,
                next_element_id: 0,
                next_sample_id: 0,
                last_timestamp: 0,
                destroyed: false,
                barrier: NotifyBarrier::default(),
            }),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn name(&self) -> &Arc<str> {
        &self.shared.name
    }

    pub(crate) fn is_reader(&self) -> bool {
        self.kind == ElementKind::Reader
    }

    pub(crate) fn info(&self) -> TopicInfo {
        TopicInfo {
            name: self.shared.name.to_string(),
            ids: vec![self.id],
        }
    }

    pub(crate) fn spec(&self) -> TopicSpec {
        let state = self.state.lock();
        TopicSpec {
            id: self.id,
            name: self.shared.name.to_string(),
            elements: element_infos(&state),
            tags: self.shared.tag_infos(),
        }
    }

    // ========================================================================
    // Elements
    // ========================================================================

    /// Create a reader or writer element and announce it to attached peers.
    pub(crate) fn create_element(&self, binding: Binding, config: ElementConfig) -> Result<i64> {
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(Error::Destroyed);
        }
        state.next_element_id += 1;
        let id = state.next_element_id;

        let mut config = config.merged(&self.shared.defaults(self.kind));
        let name: Arc<str> = match &config.name {
            Some(name) => Arc::from(name.as_str()),
            None => Arc::from(format!("{}-{}-{}", self.node_name, self.shared.name, id)),
        };
        config.name = Some(name.to_string());
        if let Some(filter) = &config.sample_filter {
            // Rejected locally before any peer sees it.
            self.shared
                .sample_filters
                .create(&filter.name, &filter.criteria)?;
        }

        match &binding {
            Binding::Keys(keys) => {
                for key in keys {
                    state.keyed.entry(key.clone()).or_default().insert(id);
                }
            }
            Binding::Filter(filter) => {
                state.filtered.entry(filter.clone()).or_default().insert(id);
            }
        }
        let element = DataElement::new(
            id,
            name,
            self.kind,
            binding,
            config,
            self.executor.clone(),
        );
        let infos = element.infos();
        log::debug!(
            "[TOPIC] {}: created {:?} element {} ({})",
            self.shared.name,
            self.kind,
            id,
            element.name
        );
        state.elements.insert(id, element);

        for attached in state.sessions.values() {
            if attached.topics.values().any(|t| t.attached) {
                attached.session.send(SessionRequest::AnnounceElements {
                    topic: self.id,
                    elements: infos.clone(),
                });
            }
        }
        Ok(id)
    }

    /// Destroy an element and detach it from every peer.
    pub(crate) fn destroy_element(&self, id: i64) {
        let mut state = self.state.lock();
        let Some(element) = state.elements.remove(&id) else {
            return;
        };
        match &element.binding {
            Binding::Keys(keys) => {
                for key in keys {
                    if let Some(ids) = state.keyed.get_mut(key) {
                        ids.remove(&id);
                        if ids.is_empty() {
                            state.keyed.remove(key);
                        }
                    }
                }
            }
            Binding::Filter(filter) => {
                if let Some(ids) = state.filtered.get_mut(filter) {
                    ids.remove(&id);
                    if ids.is_empty() {
                        state.filtered.remove(filter);
                    }
                }
            }
        }
        let attach_ids = element.attach_ids();
        let sessions: BTreeSet<Arc<str>> = element
            .subscribers()
            .map(|(sid, _)| sid.session.clone())
            .collect();
        for attached in state.sessions.values_mut() {
            attached.forget_local_element(id);
        }
        for sid in &sessions {
            if let Some(attached) = state.sessions.get(sid) {
                attached.session.send(SessionRequest::DetachElements {
                    topic: self.id,
                    elements: attach_ids.clone(),
                    element: id,
                });
            }
        }
        log::debug!("[TOPIC] {}: destroyed element {}", self.shared.name, id);
        barrier::notify(&mut state, &self.cond);
    }

    /// Run `f` on an element.
    pub(crate) fn with_element<R>(&self, id: i64, f: impl FnOnce(&mut DataElement) -> R) -> Result<R> {
        let mut state = self.state.lock();
        state
            .elements
            .get_mut(&id)
            .map(f)
            .ok_or(Error::Destroyed)
    }

    // ========================================================================
    // Publish
    // ========================================================================

    /// Publish a sample from writer element `element`.
    pub(crate) fn publish(
        &self,
        element: i64,
        key: Option<KeyRef>,
        event: SampleEvent,
        encoded: Vec<u8>,
        value: Option<AnyValue>,
        tag: Option<TagRef>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(Error::Destroyed);
        }
        let now = now_micros();
        let timestamp = now.max(state.last_timestamp + 1);
        state.last_timestamp = timestamp;
        state.next_sample_id += 1;
        let id = state.next_sample_id;

        let Some(writer) = state.elements.get_mut(&element) else {
            return Err(Error::Destroyed);
        };
        let value = match (event, &tag) {
            (SampleEvent::PartialUpdate, Some(tag)) => {
                self.shared
                    .apply_update(tag, writer.baseline(key.as_ref()), &encoded)
            }
            _ => value,
        };
        let mut sample = Sample::new(
            id,
            event,
            key,
            tag,
            timestamp,
            writer.name.clone(),
            Arc::from(""),
            Arc::from(encoded),
        );
        if let Some(value) = value {
            sample = sample.with_value(value);
        }
        let sample = Arc::new(sample);
        writer.publish(sample.clone(), now);

        let attach = writer.attach_id_for(sample.key.as_ref());
        let sessions: BTreeSet<Arc<str>> = writer
            .subscribers()
            .filter(|(_, subscriber)| subscriber.wants(&sample))
            .map(|(sid, _)| sid.session.clone())
            .collect();
        if sessions.is_empty() {
            return Ok(());
        }
        let data = sample.to_data_sample(attach < 0, false, self.shared.values.as_ref());
        for sid in sessions {
            if let Some(attached) = state.sessions.get(&sid) {
                attached.session.send(SessionRequest::Sample {
                    topic: self.id,
                    element: attach,
                    origin: element,
                    sample: data.clone(),
                });
            }
        }
        Ok(())
    }

    /// Announce a newly registered update tag to attached peers.
    pub(crate) fn announce_tag(&self, tag: &TagRef) {
        let state = self.state.lock();
        let info = ElementInfo {
            id: tag.id(),
            name: String::new(),
            value: tag.encoded().to_vec(),
        };
        for attached in state.sessions.values() {
            if attached.topics.values().any(|t| t.attached) {
                attached.session.send(SessionRequest::AttachTags {
                    topic: self.id,
                    tags: vec![info.clone()],
                    initialize: false,
                });
            }
        }
    }

    // ========================================================================
    // Waits
    // ========================================================================

    fn check(&self, state: &TopicState) -> Result<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(Error::NodeShutdown);
        }
        if state.destroyed {
            return Err(Error::Destroyed);
        }
        Ok(())
    }

    /// Whether a peer topic is attached.
    pub(crate) fn has_listeners(&self) -> bool {
        self.state.lock().listener_count > 0
    }

    /// Block until at least `count` peer topics are attached.
    pub(crate) fn wait_for_listeners(&self, count: usize) -> Result<()> {
        let mut state = self.state.lock();
        barrier::wait(&mut state, &self.cond, |s| {
            self.check(s)?;
            Ok(s.listener_count >= count)
        })
    }

    pub(crate) fn wait_for_no_listeners(&self) -> Result<()> {
        let mut state = self.state.lock();
        barrier::wait(&mut state, &self.cond, |s| {
            self.check(s)?;
            Ok(s.listener_count == 0)
        })
    }

    /// Block until element `id` has at least `count` attached remote elements.
    pub(crate) fn wait_for_element_listeners(&self, id: i64, count: usize) -> Result<()> {
        let mut state = self.state.lock();
        barrier::wait(&mut state, &self.cond, |s| {
            self.check(s)?;
            let element = s.elements.get(&id).ok_or(Error::Destroyed)?;
            Ok(element.listener_count() >= count)
        })
    }

    pub(crate) fn wait_for_no_element_listeners(&self, id: i64) -> Result<()> {
        let mut state = self.state.lock();
        barrier::wait(&mut state, &self.cond, |s| {
            self.check(s)?;
            let element = s.elements.get(&id).ok_or(Error::Destroyed)?;
            Ok(element.listener_count() == 0)
        })
    }

    /// Block until element `id` has at least `count` unread samples.
    pub(crate) fn wait_for_unread(&self, id: i64, count: usize) -> Result<()> {
        let mut state = self.state.lock();
        barrier::wait(&mut state, &self.cond, |s| {
            self.check(s)?;
            let element = s.elements.get(&id).ok_or(Error::Destroyed)?;
            Ok(element.history.unread() >= count)
        })
    }

    /// Block until element `id` has an unread sample and consume it.
    pub(crate) fn next_unread(&self, id: i64) -> Result<Arc<Sample>> {
        let mut state = self.state.lock();
        let mut next = None;
        barrier::wait(&mut state, &self.cond, |s| {
            self.check(s)?;
            let element = s.elements.get_mut(&id).ok_or(Error::Destroyed)?;
            next = element.history.next_unread();
            Ok(next.is_some())
        })?;
        next.ok_or(Error::Destroyed)
    }

    /// Wake every waiter so it observes the shutdown flag.
    pub(crate) fn notify_shutdown(&self) {
        let mut state = self.state.lock();
        barrier::notify(&mut state, &self.cond);
    }

    // ========================================================================
    // Destruction
    // ========================================================================

    /// Mark destroyed and release every element. Returns the sessions the
    /// topic was attached to, to be detached outside the topic lock.
    pub(crate) fn destroy(&self) -> Vec<Arc<Session>> {
        let mut state = self.state.lock();
        if state.destroyed {
            return Vec::new();
        }
        state.destroyed = true;
        state.elements.clear();
        state.keyed.clear();
        state.filtered.clear();
        state.listener_count = 0;
        let sessions = state
            .sessions
            .drain()
            .map(|(_, attached)| attached.session)
            .collect();
        barrier::notify(&mut state, &self.cond);
        log::debug!("[TOPIC] {}: destroyed {:?} topic {}", self.shared.name, self.kind, self.id);
        sessions
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    // ========================================================================
    // Sample construction
    // ========================================================================

    /// Build the sample a reader element queues for a received data sample.
    fn received_sample(
        &self,
        element: &DataElement,
        data: &crate::protocol::DataSample,
        key: Option<KeyRef>,
        tag: Option<TagRef>,
        origin: Arc<str>,
        session: Arc<str>,
    ) -> Option<Arc<Sample>> {
        let value = match data.event {
            SampleEvent::Remove => None,
            SampleEvent::PartialUpdate => {
                let Some(tag) = &tag else {
                    log::debug!(
                        "[TOPIC] {}: partial update {} with unknown tag {}",
                        self.shared.name,
                        data.id,
                        data.tag
                    );
                    return None;
                };
                Some(self.shared.apply_update(
                    tag,
                    element.baseline(key.as_ref()),
                    &data.value,
                )?)
            }
            SampleEvent::Add | SampleEvent::Update => {
                match self.shared.values.decode(&data.value) {
                    Ok(value) => Some(value),
                    Err(e) => {
                        log::debug!(
                            "[TOPIC] {}: dropping sample {}: {}",
                            self.shared.name,
                            data.id,
                            e
                        );
                        return None;
                    }
                }
            }
        };
        let mut sample = Sample::new(
            data.id,
            data.event,
            key,
            tag,
            data.timestamp,
            origin,
            session,
            Arc::from(data.value.as_slice()),
        );
        if let Some(value) = value {
            sample = sample.with_value(value);
        }
        Some(Arc::new(sample))
    }
}

/// Key and filter infos of every element, deduplicated.
fn element_infos(state: &TopicState) -> Vec<ElementInfo> {
    let mut seen = BTreeSet::new();
    state
        .elements
        .values()
        .flat_map(DataElement::infos)
        .filter(|info| seen.insert(info.id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::CodecError;
    use crate::core::element::history::{to_wire, ReplayRequest};
    use crate::core::session::SessionKind;
    use crate::protocol::{ClearHistoryPolicy, NodeRef};

    pub(super) struct StringCodec;

    impl ValueCodec for StringCodec {
        fn encode(&self, value: &AnyValue) -> Vec<u8> {
            value
                .downcast_ref::<String>()
                .map(|s| s.as_bytes().to_vec())
                .unwrap_or_default()
        }

        fn decode(&self, bytes: &[u8]) -> std::result::Result<AnyValue, CodecError> {
            String::from_utf8(bytes.to_vec())
                .map(|s| Arc::new(s) as AnyValue)
                .map_err(|e| CodecError::new(e.to_string()))
        }
    }

    pub(super) fn topic(kind: ElementKind) -> TopicCore {
        let shared = Arc::new(TopicShared::new(
            "prices",
            ValueFactory::keys(Arc::new(StringCodec)),
            ValueFactory::tags(Arc::new(StringCodec)),
            Arc::new(StringCodec),
            ElementConfig::default(),
            ElementConfig::default(),
        ));
        let executor = Arc::new(CallbackExecutor::new("topic-test", None).expect("executor"));
        TopicCore::new(kind, shared, Arc::from("node"), executor, Arc::new(AtomicBool::new(false)))
    }

    fn append() -> Updater {
        Arc::new(|base: Option<&AnyValue>, update: &[u8]| {
            let mut value = base
                .and_then(|b| b.downcast_ref::<String>())
                .cloned()
                .unwrap_or_default();
            value.push_str(&String::from_utf8_lossy(update));
            Ok(Arc::new(value) as AnyValue)
        })
    }

    fn string_values(samples: &[Arc<Sample>]) -> Vec<Option<String>> {
        samples
            .iter()
            .map(|s| s.decoded().and_then(|v| v.downcast_ref::<String>().cloned()))
            .collect()
    }

    #[test]
    fn test_element_names_and_spec() {
        let topic = topic(ElementKind::Writer);
        let key = topic.shared.keys.create(Arc::new("AAPL".to_string()), b"AAPL");
        let id = topic
            .create_element(Binding::Keys(vec![key.clone()]), ElementConfig::default())
            .expect("element");
        let always = topic.shared.key_filters.always_match().expect("always");
        topic
            .create_element(Binding::Filter(always), ElementConfig::default())
            .expect("element");
        topic
            .create_element(Binding::Keys(vec![key.clone()]), ElementConfig::default())
            .expect("element");

        let name = topic.with_element(id, |e| e.name.clone()).expect("element");
        assert_eq!(&*name, "node-prices-1");

        let spec = topic.spec();
        let ids: Vec<i64> = spec.elements.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![key.id(), -1]);
    }

    #[test]
    fn test_publish_records_history() {
        let topic = topic(ElementKind::Writer);
        let key = topic.shared.keys.create(Arc::new("AAPL".to_string()), b"AAPL");
        let config = ElementConfig {
            clear_history: Some(ClearHistoryPolicy::Never),
            ..Default::default()
        };
        let id = topic
            .create_element(Binding::Keys(vec![key.clone()]), config)
            .expect("element");
        for price in ["1", "2"] {
            topic
                .publish(
                    id,
                    Some(key.clone()),
                    SampleEvent::Update,
                    price.as_bytes().to_vec(),
                    Some(Arc::new(price.to_string())),
                    None,
                )
                .expect("publish");
        }
        let samples = topic.with_element(id, |e| e.history.all()).expect("element");
        assert_eq!(samples.len(), 2);
        assert!(samples[0].id < samples[1].id);
        assert!(samples[0].timestamp < samples[1].timestamp);
        assert_eq!(&*samples[0].origin, "node-prices-1");
    }

    #[test]
    fn test_partial_update_materialized_on_publish() {
        let topic = topic(ElementKind::Writer);
        let key = topic.shared.keys.create(Arc::new("AAPL".to_string()), b"AAPL");
        let tag = topic.shared.tags.create(Arc::new("append".to_string()), b"append");
        topic.shared.set_updater(tag.clone(), append());
        let id = topic
            .create_element(Binding::Keys(vec![key.clone()]), ElementConfig::default())
            .expect("element");
        topic
            .publish(
                id,
                Some(key.clone()),
                SampleEvent::Add,
                b"ab".to_vec(),
                Some(Arc::new("ab".to_string())),
                None,
            )
            .expect("add");
        topic
            .publish(
                id,
                Some(key.clone()),
                SampleEvent::PartialUpdate,
                b"cd".to_vec(),
                None,
                Some(tag),
            )
            .expect("partial update");

        let last = topic
            .with_element(id, |e| e.history.last().cloned())
            .expect("element")
            .expect("sample");
        let value = last.decoded().and_then(|v| v.downcast_ref::<String>().cloned());
        assert_eq!(value.as_deref(), Some("abcd"));
    }

    #[test]
    fn test_waits_fail_after_destroy() {
        let topic = Arc::new(topic(ElementKind::Reader));
        let waiter = {
            let topic = topic.clone();
            std::thread::spawn(move || topic.wait_for_listeners(1))
        };
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while topic.state.lock().barrier.waiters() == 0 {
            assert!(std::time::Instant::now() < deadline, "waiter never registered");
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert!(topic.destroy().is_empty());
        assert!(matches!(waiter.join().expect("join"), Err(Error::Destroyed)));
        assert!(topic.create_element(Binding::Keys(Vec::new()), ElementConfig::default()).is_err());
    }

    #[test]
    fn test_reconnect_reaps_topics_not_reannounced() {
        let topic = topic(ElementKind::Reader);
        let session = Arc::new(Session::new(
            SessionKind::Subscriber,
            NodeRef::new("peer", None),
            std::sync::Weak::new(),
        ));
        topic.attach_session(&session, 7, 1);
        topic.attach_session(&session, 8, 1);
        assert!(topic.has_listeners());

        // The tables survive the disconnect so the resumed session can
        // replay from the last seen ids.
        topic.detach_session("peer");
        assert!(!topic.has_listeners());
        let mut remote = topic.remote_topics("peer");
        remote.sort_unstable();
        assert_eq!(remote, vec![7, 8]);

        // Only topic 8 exists after the peer restarts its announcements.
        topic.attach_session(&session, 8, 2);
        topic.reap_topics("peer", 2);
        assert_eq!(topic.remote_topics("peer"), vec![8]);
        assert!(topic.has_listeners());

        topic.reap_topics("peer", 3);
        assert!(topic.remote_topics("peer").is_empty());
        assert!(!topic.has_listeners());
    }

    #[test]
    fn test_replay_into_fresh_reader_matches_direct_delivery() {
        let writer = topic(ElementKind::Writer);
        let wkey = writer.shared.keys.create(Arc::new("AAPL".to_string()), b"AAPL");
        let wtag = writer.shared.tags.create(Arc::new("append".to_string()), b"append");
        writer.shared.set_updater(wtag.clone(), append());
        let writer_id = writer
            .create_element(
                Binding::Keys(vec![wkey.clone()]),
                ElementConfig {
                    clear_history: Some(ClearHistoryPolicy::Never),
                    ..Default::default()
                },
            )
            .expect("writer");

        let publishes: [(SampleEvent, &str); 5] = [
            (SampleEvent::Add, "a"),
            (SampleEvent::PartialUpdate, "b"),
            (SampleEvent::Update, "x"),
            (SampleEvent::PartialUpdate, "y"),
            (SampleEvent::PartialUpdate, "z"),
        ];
        for (event, text) in publishes {
            let partial = event == SampleEvent::PartialUpdate;
            writer
                .publish(
                    writer_id,
                    Some(wkey.clone()),
                    event,
                    text.as_bytes().to_vec(),
                    (!partial).then(|| Arc::new(text.to_string()) as AnyValue),
                    partial.then(|| wtag.clone()),
                )
                .expect("publish");
        }

        let reader = topic(ElementKind::Reader);
        let rkey = reader.shared.keys.create(Arc::new("AAPL".to_string()), b"AAPL");
        let rtag = reader.shared.tags.create(Arc::new("append".to_string()), b"append");
        reader.shared.set_updater(rtag.clone(), append());
        let config = ElementConfig {
            sample_count: Some(2),
            clear_history: Some(ClearHistoryPolicy::Never),
            ..Default::default()
        };
        let direct = reader
            .create_element(Binding::Keys(vec![rkey.clone()]), config.clone())
            .expect("reader");
        let replayed = reader
            .create_element(Binding::Keys(vec![rkey.clone()]), config.clone())
            .expect("reader");

        let deliver = |local: i64, data: &crate::protocol::DataSample| {
            let tag = (data.tag == wtag.id()).then(|| rtag.clone());
            reader
                .with_element(local, |e| {
                    let sample = reader
                        .received_sample(
                            e,
                            data,
                            Some(rkey.clone()),
                            tag,
                            Arc::from("w"),
                            Arc::from("s"),
                        )
                        .expect("received sample");
                    e.queue(sample, 0, data.timestamp)
                })
                .expect("element")
        };

        let history = writer.with_element(writer_id, |e| e.history.all()).expect("writer");
        let codec = writer.shared.values.clone();
        for sample in &history {
            assert!(deliver(direct, &sample.to_data_sample(false, false, &*codec)));
        }

        let now = history.last().map_or(0, |s| s.timestamp);
        let replay = writer
            .with_element(writer_id, |e| {
                e.history.replay(&ReplayRequest {
                    key: Some(&wkey),
                    key_filter: None,
                    sample_filter: None,
                    peer: &config,
                    last_id: 0,
                    now,
                })
            })
            .expect("writer");
        // Cut by the peer's sample count in the middle of the partial updates.
        assert_eq!(replay.first().map(|s| s.event), Some(SampleEvent::PartialUpdate));
        for data in to_wire(&replay, false, &*codec) {
            assert!(deliver(replayed, &data));
        }

        let direct = reader.with_element(direct, |e| e.history.all()).expect("reader");
        let replayed = reader.with_element(replayed, |e| e.history.all()).expect("reader");
        let ids = |samples: &[Arc<Sample>]| samples.iter().map(|s| s.id).collect::<Vec<_>>();
        assert_eq!(ids(&direct), vec![4, 5]);
        assert_eq!(ids(&replayed), ids(&direct));
        assert_eq!(string_values(&replayed), string_values(&direct));
        assert_eq!(
            string_values(&direct),
            vec![Some("xy".to_string()), Some("xyz".to_string())]
        );
        // The oldest replayed sample carries its full value instead.
        assert_eq!(replayed[0].event, SampleEvent::Update);
        assert_eq!(replayed[1].event, direct[1].event);
    }
}
