// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Data elements: the engine side of readers and writers.
//!
//! A [`DataElement`] is bound either to a set of keys or to one key filter
//! (any-key writers and readers use the always-match filter). Remote elements
//! attached to it are tracked as [`Subscriber`]s, indexed by
//! `(session, remote topic, remote element)`.
//!
//! ```text
//! DataElement
//! +-- listeners:  SubscriberId -> Subscriber { keys, filter, priority, .. }
//! +-- connected:  key (or none) -> [(priority, SubscriberId)] ascending
//! +-- history:    samples + unread counter
//! +-- callbacks:  connected keys / connected elements / samples
//! ```
//!
//! Elements are only touched under their topic's lock. Callbacks are queued
//! on the callback executor and run after the lock is released.

pub(crate) mod history;

use crate::api::CallbackReason;
use crate::core::executor::CallbackExecutor;
use crate::core::interner::{AnyValue, FilterRef, KeyRef};
use crate::core::sample::Sample;
use crate::protocol::{DiscardPolicy, ElementConfig, ElementInfo, SampleEvent};
use history::{History, Retention};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

pub(crate) type KeysCallback = Arc<dyn Fn(CallbackReason, KeyRef) + Send + Sync>;
pub(crate) type ElementsCallback = Arc<dyn Fn(CallbackReason, Arc<str>) + Send + Sync>;
pub(crate) type SamplesCallback = Arc<dyn Fn(Arc<Sample>) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum ElementKind {
    Reader,
    Writer,
}

/// What an element is attached to.
#[derive(Clone, Debug)]
pub(crate) enum Binding {
    Keys(Vec<KeyRef>),
    Filter(FilterRef),
}

/// Remote element attached to a local element.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct SubscriberId {
    pub(crate) session: Arc<str>,
    pub(crate) topic: i64,
    pub(crate) element: i64,
}

/// Description of the remote side of an attachment.
#[derive(Clone)]
pub(crate) struct RemoteElement {
    /// Remote key filter, when the remote element is filter-bound.
    pub(crate) filter: Option<FilterRef>,
    /// Sample filter requested by a remote reader.
    pub(crate) sample_filter: Option<FilterRef>,
    pub(crate) name: Arc<str>,
    pub(crate) priority: i32,
    pub(crate) config: ElementConfig,
}

pub(crate) struct Subscriber {
    /// Keys the attachment went through; empty for filter/filter pairs.
    pub(crate) keys: BTreeSet<KeyRef>,
    pub(crate) remote: RemoteElement,
}

impl Subscriber {
    /// Whether a sample on `key` must be sent to this subscriber.
    pub(crate) fn wants(&self, sample: &Sample) -> bool {
        let key_ok = if !self.keys.is_empty() {
            sample.key.as_ref().is_some_and(|k| self.keys.contains(k))
        } else {
            match (&self.remote.filter, &sample.key) {
                (Some(filter), Some(key)) => filter.matches_key(key),
                _ => true,
            }
        };
        key_ok
            && self
                .remote
                .sample_filter
                .as_ref()
                .map_or(true, |f| f.matches_sample(sample))
    }
}

#[derive(Default)]
struct Callbacks {
    keys: Option<KeysCallback>,
    elements: Option<ElementsCallback>,
    samples: Option<SamplesCallback>,
}

pub(crate) struct DataElement {
    pub(crate) id: i64,
    pub(crate) name: Arc<str>,
    pub(crate) kind: ElementKind,
    pub(crate) binding: Binding,
    /// Resolved configuration (own values over topic defaults).
    pub(crate) config: ElementConfig,
    retention: Retention,
    priority: i32,
    discard: DiscardPolicy,
    listeners: HashMap<SubscriberId, Subscriber>,
    connected: BTreeMap<Option<KeyRef>, Vec<(i32, SubscriberId)>>,
    pub(crate) history: History,
    last_timestamp: i64,
    /// Latest value per key id (0 for keyless samples), base of partial updates.
    baselines: HashMap<i64, AnyValue>,
    callbacks: Callbacks,
    executor: Arc<CallbackExecutor>,
}

impl DataElement {
    pub(crate) fn new(
        id: i64,
        name: Arc<str>,
        kind: ElementKind,
        binding: Binding,
        config: ElementConfig,
        executor: Arc<CallbackExecutor>,
    ) -> Self {
        Self {
            id,
            name,
            kind,
            binding,
            retention: Retention::from_config(&config),
            priority: config.priority.unwrap_or(crate::config::DEFAULT_PRIORITY),
            discard: config
                .discard_policy
                .unwrap_or(crate::config::DEFAULT_DISCARD_POLICY),
            config,
            listeners: HashMap::new(),
            connected: BTreeMap::new(),
            history: History::default(),
            last_timestamp: i64::MIN,
            baselines: HashMap::new(),
            callbacks: Callbacks::default(),
            executor,
        }
    }

    pub(crate) fn is_reader(&self) -> bool {
        self.kind == ElementKind::Reader
    }

    pub(crate) fn priority(&self) -> i32 {
        self.priority
    }

    pub(crate) fn keys(&self) -> &[KeyRef] {
        match &self.binding {
            Binding::Keys(keys) => keys,
            Binding::Filter(_) => &[],
        }
    }

    pub(crate) fn filter(&self) -> Option<&FilterRef> {
        match &self.binding {
            Binding::Keys(_) => None,
            Binding::Filter(filter) => Some(filter),
        }
    }

    /// Ids this element is announced under: key ids, or the negated filter id.
    pub(crate) fn attach_ids(&self) -> Vec<i64> {
        match &self.binding {
            Binding::Keys(keys) => keys.iter().map(KeyRef::id).collect(),
            Binding::Filter(filter) => vec![-filter.id()],
        }
    }

    /// Attach id a sample on `key` is sent under.
    pub(crate) fn attach_id_for(&self, key: Option<&KeyRef>) -> i64 {
        match (&self.binding, key) {
            (Binding::Keys(_), Some(key)) => key.id(),
            (Binding::Filter(filter), _) => -filter.id(),
            (Binding::Keys(keys), None) => keys.first().map_or(0, KeyRef::id),
        }
    }

    pub(crate) fn infos(&self) -> Vec<ElementInfo> {
        match &self.binding {
            Binding::Keys(keys) => keys
                .iter()
                .map(|key| ElementInfo {
                    id: key.id(),
                    name: String::new(),
                    value: key.encoded().to_vec(),
                })
                .collect(),
            Binding::Filter(filter) => vec![filter_info(filter)],
        }
    }

    // ========================================================================
    // Listeners
    // ========================================================================

    /// Attach a remote element through `key` (`None` for filter/filter
    /// pairs). Returns `true` if the remote element was not attached yet.
    pub(crate) fn attach(
        &mut self,
        id: SubscriberId,
        key: Option<KeyRef>,
        remote: RemoteElement,
    ) -> bool {
        let priority = remote.priority;
        let mut added = false;
        let subscriber = self.listeners.entry(id.clone()).or_insert_with(|| {
            added = true;
            Subscriber {
                keys: BTreeSet::new(),
                remote: remote.clone(),
            }
        });
        if !added {
            subscriber.remote = remote;
        }
        if added {
            log::debug!(
                "[ELEMENT] {} attached remote element {} ({})",
                self.name,
                subscriber.remote.name,
                id.element
            );
            let name = subscriber.remote.name.clone();
            self.fire_element(CallbackReason::Connect, name);
        }

        let connect = match &key {
            Some(key) => self
                .listeners
                .get_mut(&id)
                .is_some_and(|s| s.keys.insert(key.clone())),
            None => added,
        };
        if connect {
            self.add_connected(key, priority, id);
        }
        added
    }

    pub(crate) fn detach_subscriber(&mut self, id: &SubscriberId) {
        let Some(subscriber) = self.listeners.remove(id) else {
            return;
        };
        let keys: Vec<Option<KeyRef>> = if subscriber.keys.is_empty() {
            vec![None]
        } else {
            subscriber.keys.iter().cloned().map(Some).collect()
        };
        for key in keys {
            self.remove_connected(key, id);
        }
        log::debug!(
            "[ELEMENT] {} detached remote element {} ({})",
            self.name,
            subscriber.remote.name,
            id.element
        );
        self.fire_element(CallbackReason::Disconnect, subscriber.remote.name);
    }

    /// Detach every subscriber matching `pred`.
    pub(crate) fn detach_where(&mut self, mut pred: impl FnMut(&SubscriberId) -> bool) {
        let ids: Vec<SubscriberId> = self.listeners.keys().filter(|id| pred(id)).cloned().collect();
        for id in ids {
            self.detach_subscriber(&id);
        }
    }

    pub(crate) fn is_attached(&self, id: &SubscriberId) -> bool {
        self.listeners.contains_key(id)
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub(crate) fn subscribers(&self) -> impl Iterator<Item = (&SubscriberId, &Subscriber)> {
        self.listeners.iter()
    }

    pub(crate) fn connected_keys(&self) -> Vec<KeyRef> {
        self.connected.keys().filter_map(Clone::clone).collect()
    }

    pub(crate) fn connected_elements(&self) -> Vec<Arc<str>> {
        let mut names: Vec<Arc<str>> = self
            .listeners
            .values()
            .map(|s| s.remote.name.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    fn add_connected(&mut self, key: Option<KeyRef>, priority: i32, id: SubscriberId) {
        let entries = self.connected.entry(key.clone()).or_default();
        let first = entries.is_empty();
        let at = entries.partition_point(|(p, _)| *p <= priority);
        entries.insert(at, (priority, id));
        if first {
            if let Some(key) = key {
                self.fire_key(CallbackReason::Connect, key);
            }
        }
    }

    fn remove_connected(&mut self, key: Option<KeyRef>, id: &SubscriberId) {
        let Some(entries) = self.connected.get_mut(&key) else {
            return;
        };
        entries.retain(|(_, e)| e != id);
        if entries.is_empty() {
            self.connected.remove(&key);
            if let Some(key) = key {
                self.fire_key(CallbackReason::Disconnect, key);
            }
        }
    }

    /// Highest priority among the writers connected for `key`.
    fn connected_priority(&self, key: Option<&KeyRef>) -> Option<i32> {
        key.and_then(|k| self.connected.get(&Some(k.clone())))
            .filter(|entries| !entries.is_empty())
            .or_else(|| self.connected.get(&None))
            .and_then(|entries| entries.last())
            .map(|(p, _)| *p)
    }

    // ========================================================================
    // Samples
    // ========================================================================

    /// Record a locally published sample (writers).
    pub(crate) fn publish(&mut self, sample: Arc<Sample>, now: i64) {
        self.update_baseline(&sample);
        self.history.push(sample, &self.retention, now, false);
    }

    /// Queue a received sample (readers). `priority` is the sending
    /// writer's priority. Returns `false` if the sample was discarded.
    pub(crate) fn queue(&mut self, sample: Arc<Sample>, priority: i32, now: i64) -> bool {
        match self.discard {
            DiscardPolicy::None => {}
            DiscardPolicy::SendTime => {
                if sample.timestamp <= self.last_timestamp {
                    log::trace!(
                        "[ELEMENT] {} discarded sample {} (send time)",
                        self.name,
                        sample.id
                    );
                    return false;
                }
            }
            DiscardPolicy::Priority => {
                if self
                    .connected_priority(sample.key.as_ref())
                    .is_some_and(|max| max > priority)
                {
                    log::trace!(
                        "[ELEMENT] {} discarded sample {} (priority {})",
                        self.name,
                        sample.id,
                        priority
                    );
                    return false;
                }
            }
        }
        if let Binding::Filter(filter) = &self.binding {
            if sample.key.as_ref().is_some_and(|k| !filter.matches_key(k)) {
                return false;
            }
        }

        self.last_timestamp = self.last_timestamp.max(sample.timestamp);
        self.update_baseline(&sample);
        self.history.push(sample.clone(), &self.retention, now, true);
        if let Some(callback) = self.callbacks.samples.clone() {
            self.executor.queue(Box::new(move || callback(sample)));
        }
        true
    }

    /// Current value of `key`, the base a partial update applies to.
    pub(crate) fn baseline(&self, key: Option<&KeyRef>) -> Option<&AnyValue> {
        self.baselines.get(&key.map_or(0, KeyRef::id))
    }

    fn update_baseline(&mut self, sample: &Sample) {
        let id = sample.key.as_ref().map_or(0, KeyRef::id);
        if sample.event == SampleEvent::Remove {
            self.baselines.remove(&id);
        } else if let Some(value) = sample.decoded() {
            self.baselines.insert(id, value.clone());
        }
    }

    /// Drop expired samples.
    pub(crate) fn evict(&mut self, now: i64) {
        self.history.evict(&self.retention, now);
    }

    // ========================================================================
    // Callbacks
    // ========================================================================

    /// Install the connected-keys callback; `init` receives the keys
    /// connected so far.
    pub(crate) fn on_connected_keys(
        &mut self,
        init: Box<dyn FnOnce(Vec<KeyRef>) + Send>,
        update: KeysCallback,
    ) {
        let keys = self.connected_keys();
        self.executor.queue(Box::new(move || init(keys)));
        self.callbacks.keys = Some(update);
    }

    pub(crate) fn on_connected_elements(
        &mut self,
        init: Box<dyn FnOnce(Vec<Arc<str>>) + Send>,
        update: ElementsCallback,
    ) {
        let names = self.connected_elements();
        self.executor.queue(Box::new(move || init(names)));
        self.callbacks.elements = Some(update);
    }

    /// Install the sample callback; `init` receives the unread samples.
    pub(crate) fn on_samples(
        &mut self,
        init: Box<dyn FnOnce(Vec<Arc<Sample>>) + Send>,
        update: SamplesCallback,
    ) {
        let unread = self.history.peek_unread();
        self.executor.queue(Box::new(move || init(unread)));
        self.callbacks.samples = Some(update);
    }

    fn fire_key(&self, reason: CallbackReason, key: KeyRef) {
        if let Some(callback) = self.callbacks.keys.clone() {
            self.executor.queue(Box::new(move || callback(reason, key)));
        }
    }

    fn fire_element(&self, reason: CallbackReason, name: Arc<str>) {
        if let Some(callback) = self.callbacks.elements.clone() {
            self.executor.queue(Box::new(move || callback(reason, name)));
        }
    }
}

pub(crate) fn filter_info(filter: &FilterRef) -> ElementInfo {
    ElementInfo {
        id: -filter.id(),
        name: filter.name().to_string(),
        value: filter.criteria().to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::CodecError;
    use crate::core::interner::{ValueCodec, ValueFactory};
    use crate::protocol::ClearHistoryPolicy;
    use parking_lot::Mutex;

    struct U8Codec;

    impl ValueCodec for U8Codec {
        fn encode(&self, value: &AnyValue) -> Vec<u8> {
            value.downcast_ref::<u8>().map(|v| vec![*v]).unwrap_or_default()
        }

        fn decode(&self, bytes: &[u8]) -> Result<AnyValue, CodecError> {
            match bytes {
                [v] => Ok(Arc::new(*v)),
                _ => Err(CodecError::new("expected one byte")),
            }
        }
    }

    fn executor() -> Arc<CallbackExecutor> {
        Arc::new(CallbackExecutor::new("element-test", None).expect("executor"))
    }

    fn reader(keys: &ValueFactory, discard: DiscardPolicy) -> (DataElement, KeyRef) {
        let key = keys.create(Arc::new(1u8), &[1]);
        let config = ElementConfig {
            discard_policy: Some(discard),
            clear_history: Some(ClearHistoryPolicy::Never),
            ..Default::default()
        };
        let element = DataElement::new(
            1,
            Arc::from("reader"),
            ElementKind::Reader,
            Binding::Keys(vec![key.clone()]),
            config,
            executor(),
        );
        (element, key)
    }

    fn writer_id(element: i64) -> SubscriberId {
        SubscriberId {
            session: Arc::from("peer"),
            topic: 7,
            element,
        }
    }

    fn remote(name: &str, priority: i32) -> RemoteElement {
        RemoteElement {
            filter: None,
            sample_filter: None,
            name: Arc::from(name),
            priority,
            config: ElementConfig::default(),
        }
    }

    fn sample(id: i64, key: &KeyRef, timestamp: i64) -> Arc<Sample> {
        Arc::new(
            Sample::new(
                id,
                SampleEvent::Add,
                Some(key.clone()),
                None,
                timestamp,
                Arc::from("w"),
                Arc::from("peer"),
                Arc::from([id as u8].as_slice()),
            )
            .with_value(Arc::new(id as u8)),
        )
    }

    #[test]
    fn test_attach_is_idempotent() {
        let keys = ValueFactory::keys(Arc::new(U8Codec));
        let (mut element, key) = reader(&keys, DiscardPolicy::None);
        assert!(element.attach(writer_id(10), Some(key.clone()), remote("w1", 0)));
        assert!(!element.attach(writer_id(10), Some(key.clone()), remote("w1", 0)));
        assert_eq!(element.listener_count(), 1);
        assert_eq!(element.connected_keys(), vec![key]);
        assert_eq!(element.connected_elements(), vec![Arc::<str>::from("w1")]);

        element.detach_subscriber(&writer_id(10));
        assert_eq!(element.listener_count(), 0);
        assert!(element.connected_keys().is_empty());
    }

    #[test]
    fn test_connected_keys_callbacks() {
        let keys = ValueFactory::keys(Arc::new(U8Codec));
        let executor = executor();
        let key = keys.create(Arc::new(1u8), &[1]);
        let mut element = DataElement::new(
            1,
            Arc::from("reader"),
            ElementKind::Reader,
            Binding::Keys(vec![key.clone()]),
            ElementConfig::default(),
            executor.clone(),
        );

        let events = Arc::new(Mutex::new(Vec::new()));
        let init_events = events.clone();
        let update_events = events.clone();
        element.on_connected_keys(
            Box::new(move |keys: Vec<KeyRef>| init_events.lock().push(format!("init:{}", keys.len()))),
            Arc::new(move |reason: CallbackReason, key: KeyRef| {
                update_events.lock().push(format!("{:?}:{}", reason, key.id()))
            }),
        );

        element.attach(writer_id(10), Some(key.clone()), remote("w1", 0));
        element.attach(writer_id(11), Some(key.clone()), remote("w2", 0));
        element.detach_subscriber(&writer_id(10));
        element.detach_subscriber(&writer_id(11));
        executor.flush();

        let id = key.id();
        assert_eq!(
            *events.lock(),
            vec![
                "init:0".to_string(),
                format!("Connect:{}", id),
                format!("Disconnect:{}", id),
            ]
        );
    }

    #[test]
    fn test_send_time_discard() {
        let keys = ValueFactory::keys(Arc::new(U8Codec));
        let (mut element, key) = reader(&keys, DiscardPolicy::SendTime);
        assert!(element.queue(sample(1, &key, 100), 0, 100));
        assert!(!element.queue(sample(2, &key, 100), 0, 100));
        assert!(!element.queue(sample(3, &key, 50), 0, 100));
        assert!(element.queue(sample(4, &key, 101), 0, 101));
        assert_eq!(element.history.len(), 2);
    }

    #[test]
    fn test_priority_discard() {
        let keys = ValueFactory::keys(Arc::new(U8Codec));
        let (mut element, key) = reader(&keys, DiscardPolicy::Priority);
        element.attach(writer_id(10), Some(key.clone()), remote("low", 1));
        element.attach(writer_id(11), Some(key.clone()), remote("high", 5));

        assert!(!element.queue(sample(1, &key, 1), 1, 1));
        assert!(element.queue(sample(2, &key, 2), 5, 2));

        element.detach_subscriber(&writer_id(11));
        assert!(element.queue(sample(3, &key, 3), 1, 3));
        assert_eq!(element.history.len(), 2);
    }

    #[test]
    fn test_priority_order_survives_reattach() {
        let keys = ValueFactory::keys(Arc::new(U8Codec));
        let (mut element, key) = reader(&keys, DiscardPolicy::Priority);
        element.attach(writer_id(11), Some(key.clone()), remote("high", 5));
        element.attach(writer_id(10), Some(key.clone()), remote("low", 1));
        element.attach(writer_id(12), Some(key.clone()), remote("mid", 3));
        assert_eq!(element.connected_priority(Some(&key)), Some(5));

        element.detach_subscriber(&writer_id(11));
        assert_eq!(element.connected_priority(Some(&key)), Some(3));
        assert!(!element.queue(sample(1, &key, 1), 1, 1));
        assert!(element.queue(sample(2, &key, 2), 3, 2));

        element.attach(writer_id(11), Some(key.clone()), remote("high", 5));
        assert_eq!(element.connected_priority(Some(&key)), Some(5));
        assert!(!element.queue(sample(3, &key, 3), 3, 3));
        assert!(element.queue(sample(4, &key, 4), 5, 4));
    }

    #[test]
    fn test_send_time_converges_to_latest() {
        let keys = ValueFactory::keys(Arc::new(U8Codec));
        let key = keys.create(Arc::new(1u8), &[1]);
        for seed in 0..50 {
            let mut rng = fastrand::Rng::with_seed(seed);
            let mut element = DataElement::new(
                1,
                Arc::from("reader"),
                ElementKind::Reader,
                Binding::Keys(vec![key.clone()]),
                ElementConfig {
                    discard_policy: Some(DiscardPolicy::SendTime),
                    clear_history: Some(ClearHistoryPolicy::Never),
                    ..Default::default()
                },
                executor(),
            );
            let mut timestamps: Vec<i64> = (1..=20).collect();
            rng.shuffle(&mut timestamps);

            let mut newest = i64::MIN;
            for (i, timestamp) in timestamps.iter().enumerate() {
                let accepted = element.queue(sample(i as i64 + 1, &key, *timestamp), 0, *timestamp);
                assert_eq!(accepted, *timestamp > newest, "seed {}", seed);
                newest = newest.max(*timestamp);
            }
            let kept: Vec<i64> = element.history.all().iter().map(|s| s.timestamp).collect();
            assert!(kept.windows(2).all(|w| w[0] < w[1]), "seed {}", seed);
            assert_eq!(kept.last(), Some(&20));
        }
    }

    #[test]
    fn test_samples_callback_and_baseline() {
        let keys = ValueFactory::keys(Arc::new(U8Codec));
        let executor = executor();
        let key = keys.create(Arc::new(1u8), &[1]);
        let mut element = DataElement::new(
            1,
            Arc::from("reader"),
            ElementKind::Reader,
            Binding::Keys(vec![key.clone()]),
            ElementConfig::default(),
            executor.clone(),
        );
        element.queue(sample(1, &key, 1), 0, 1);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let init_seen = seen.clone();
        let update_seen = seen.clone();
        element.on_samples(
            Box::new(move |samples: Vec<Arc<Sample>>| init_seen.lock().extend(samples.iter().map(|s| s.id))),
            Arc::new(move |s: Arc<Sample>| update_seen.lock().push(s.id)),
        );
        element.queue(sample(2, &key, 2), 0, 2);
        executor.flush();

        assert_eq!(*seen.lock(), vec![1, 2]);
        let baseline = element.baseline(Some(&key)).expect("baseline");
        assert_eq!(baseline.downcast_ref::<u8>(), Some(&2));
    }

    #[test]
    fn test_subscriber_send_rule() {
        let keys = ValueFactory::keys(Arc::new(U8Codec));
        let a = keys.create(Arc::new(1u8), &[1]);
        let b = keys.create(Arc::new(2u8), &[2]);

        let keyed = Subscriber {
            keys: [a.clone()].into_iter().collect(),
            remote: remote("r", 0),
        };
        assert!(keyed.wants(&sample(1, &a, 1)));
        assert!(!keyed.wants(&sample(2, &b, 2)));

        let any = Subscriber {
            keys: BTreeSet::new(),
            remote: remote("r", 0),
        };
        assert!(any.wants(&sample(3, &b, 3)));
    }
}
