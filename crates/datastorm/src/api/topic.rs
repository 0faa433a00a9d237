// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Typed topics.
//!
//! A [`Topic`] is the typed front of two engine topics of the same name: the
//! reader topic (created with the first reader) and the writer topic (created
//! with the first writer). Both share the key, tag and filter factories.
//!
//! ```text
//! Topic<K, V, U> (clone = same topic)
//! +-- TopicShared    keys, tags, filters, updaters, defaults
//! +-- reader core    TopicCore(Reader), lazily created
//! +-- writer core    TopicCore(Writer), lazily created
//! ```
//!
//! The engine topics are destroyed when the last `Topic` clone and the last
//! reader or writer created from it are dropped.

use super::codec::{Codec, CodecError};
use super::filters;
use super::reader::ReaderConfig;
use super::sample::Sample;
use super::writer::WriterConfig;
use super::{CallbackReason, Error, Node, Result};
use crate::config::{EVENT_FILTER, REGEX_FILTER};
use crate::core::element::{Binding, DataElement, ElementKind};
use crate::core::instance::Instance;
use crate::core::interner::{AnyValue, KeyRef, Predicate, TagRef, ValueCodec, ValueFactory};
use crate::core::sample::Sample as CoreSample;
use crate::core::topic::{TopicCore, TopicShared};
use crate::protocol::ElementConfig;
use parking_lot::Mutex;
use std::fmt::Display;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;

/// Bound on key and update tag types.
///
/// The display string names keys in logs and is what the `_regex` key
/// filter matches against.
pub trait Key: Codec + Eq + Hash + Display {}

impl<T: Codec + Eq + Hash + Display> Key for T {}

/// [`ValueCodec`] for values of type `T`.
struct TypedCodec<T>(PhantomData<fn() -> T>);

impl<T: Codec> ValueCodec for TypedCodec<T> {
    fn encode(&self, value: &AnyValue) -> Vec<u8> {
        match value.downcast_ref::<T>() {
            Some(value) => value.encode(),
            None => {
                log::debug!("[TOPIC] value is not a {}", std::any::type_name::<T>());
                Vec::new()
            }
        }
    }

    fn decode(&self, bytes: &[u8]) -> std::result::Result<AnyValue, CodecError> {
        T::decode(bytes).map(|v| Arc::new(v) as AnyValue)
    }
}

fn typed_codec<T: Codec>() -> Arc<dyn ValueCodec> {
    Arc::new(TypedCodec::<T>(PhantomData))
}

#[derive(Default)]
struct Cores {
    reader: Option<Arc<TopicCore>>,
    writer: Option<Arc<TopicCore>>,
}

struct TopicInner {
    instance: Arc<Instance>,
    shared: Arc<TopicShared>,
    cores: Mutex<Cores>,
}

impl TopicInner {
    fn core(&self, kind: ElementKind) -> Result<Arc<TopicCore>> {
        let mut cores = self.cores.lock();
        let slot = match kind {
            ElementKind::Reader => &mut cores.reader,
            ElementKind::Writer => &mut cores.writer,
        };
        if let Some(core) = slot {
            return Ok(core.clone());
        }
        let core = self.instance.topics.create(kind, self.shared.clone())?;
        *slot = Some(core.clone());
        Ok(core)
    }

    fn created(&self) -> Vec<Arc<TopicCore>> {
        let cores = self.cores.lock();
        cores.reader.iter().chain(cores.writer.iter()).cloned().collect()
    }
}

impl Drop for TopicInner {
    fn drop(&mut self) {
        let cores = std::mem::take(&mut *self.cores.lock());
        for core in cores.reader.into_iter().chain(cores.writer) {
            self.instance.topics.remove(&core);
        }
    }
}

/// Topic with keys of type `K`, values of type `V` and partial update tags
/// of type `U`.
pub struct Topic<K, V, U = String> {
    inner: Arc<TopicInner>,
    _types: PhantomData<fn() -> (K, V, U)>,
}

impl<K, V, U> Clone for Topic<K, V, U> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _types: PhantomData,
        }
    }
}

impl<K: Key, V: Codec, U: Key> Topic<K, V, U> {
    /// Open topic `name` on `node`. Element defaults are read from the
    /// node's `DataStorm.Topic.*` properties.
    pub fn new(node: &Node, name: &str) -> Result<Self> {
        if name.is_empty() {
            return Err(Error::InvalidArgument("topic name is empty".into()));
        }
        let instance = node.instance.clone();
        if instance.is_shutdown() {
            return Err(Error::NodeShutdown);
        }
        let shared = Arc::new(TopicShared::new(
            name,
            ValueFactory::keys(typed_codec::<K>()),
            ValueFactory::tags(typed_codec::<U>()),
            typed_codec::<V>(),
            instance.config.reader_defaults()?,
            instance.config.writer_defaults()?,
        ));
        shared
            .key_filters
            .register(REGEX_FILTER, filters::regex_key::<K>());
        shared
            .sample_filters
            .register(EVENT_FILTER, filters::event_sample());
        Ok(Self {
            inner: Arc::new(TopicInner {
                instance,
                shared,
                cores: Mutex::new(Cores::default()),
            }),
            _types: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.shared.name
    }

    /// Whether a remote reader topic is attached to this topic's writers.
    pub fn has_readers(&self) -> Result<bool> {
        Ok(self.core(ElementKind::Writer)?.has_listeners())
    }

    /// Block until `count` remote reader topics are attached.
    pub fn wait_for_readers(&self, count: usize) -> Result<()> {
        self.core(ElementKind::Writer)?.wait_for_listeners(count)
    }

    pub fn wait_for_no_readers(&self) -> Result<()> {
        self.core(ElementKind::Writer)?.wait_for_no_listeners()
    }

    pub fn has_writers(&self) -> Result<bool> {
        Ok(self.core(ElementKind::Reader)?.has_listeners())
    }

    pub fn wait_for_writers(&self, count: usize) -> Result<()> {
        self.core(ElementKind::Reader)?.wait_for_listeners(count)
    }

    pub fn wait_for_no_writers(&self) -> Result<()> {
        self.core(ElementKind::Reader)?.wait_for_no_listeners()
    }

    /// Defaults for readers created afterwards. Unset fields keep their
    /// current default.
    pub fn set_reader_defaults(&self, config: ReaderConfig) {
        self.inner
            .shared
            .set_defaults(ElementKind::Reader, &config.into_element_config());
    }

    pub fn set_writer_defaults(&self, config: WriterConfig) {
        self.inner
            .shared
            .set_defaults(ElementKind::Writer, &config.into_element_config());
    }

    /// Register the function applying partial updates tagged `tag`.
    ///
    /// Writers and readers both need it: writers to keep the value they
    /// replay to late joiners, readers to compute the value they deliver.
    /// A partial update on a key with no value yet is dropped.
    pub fn set_updater<W, F>(&self, tag: U, update: F)
    where
        W: Codec,
        F: Fn(&mut V, &W) + Send + Sync + 'static,
    {
        let tag_ref = self.tag_ref(&tag);
        self.inner.shared.set_updater(
            tag_ref.clone(),
            Arc::new(move |base: Option<&AnyValue>, bytes: &[u8]| {
                let change = W::decode(bytes)?;
                let mut value = base
                    .and_then(|b| b.downcast_ref::<V>())
                    .cloned()
                    .ok_or_else(|| CodecError::new(format!("no value to update for tag {}", tag)))?;
                update(&mut value, &change);
                Ok(Arc::new(value) as AnyValue)
            }),
        );
        for core in self.inner.created() {
            core.announce_tag(&tag_ref);
        }
    }

    /// Register a key filter factory under `name`. `factory` turns the
    /// criteria of a [`Filter`](super::filters::Filter) into a predicate.
    pub fn set_key_filter<F, P>(&self, name: &str, factory: F)
    where
        F: Fn(&[u8]) -> Result<P> + Send + Sync + 'static,
        P: Fn(&K) -> bool + Send + Sync + 'static,
    {
        self.inner.shared.key_filters.register(
            name,
            Arc::new(move |criteria: &[u8]| {
                let predicate = factory(criteria)?;
                Ok(Predicate::Key(Arc::new(move |key: &AnyValue| {
                    key.downcast_ref::<K>().is_some_and(|k| predicate(k))
                })))
            }),
        );
    }

    /// Register a sample filter factory under `name`. Sample filters
    /// requested by remote readers run on the writer side.
    pub fn set_sample_filter<F, P>(&self, name: &str, factory: F)
    where
        F: Fn(&[u8]) -> Result<P> + Send + Sync + 'static,
        P: Fn(&Sample<K, V, U>) -> bool + Send + Sync + 'static,
    {
        let values = self.inner.shared.values.clone();
        self.inner.shared.sample_filters.register(
            name,
            Arc::new(move |criteria: &[u8]| {
                let predicate = factory(criteria)?;
                let values = values.clone();
                Ok(Predicate::Sample(Arc::new(move |sample: &CoreSample| {
                    Sample::<K, V, U>::from_core(sample, values.as_ref())
                        .is_some_and(|s| predicate(&s))
                })))
            }),
        );
    }

    // ========================================================================
    // Element plumbing
    // ========================================================================

    fn core(&self, kind: ElementKind) -> Result<Arc<TopicCore>> {
        if self.inner.instance.is_shutdown() {
            return Err(Error::NodeShutdown);
        }
        self.inner.core(kind)
    }

    pub(super) fn key_ref(&self, key: &K) -> KeyRef {
        self.inner
            .shared
            .keys
            .create(Arc::new(key.clone()), &key.encode())
    }

    pub(super) fn tag_ref(&self, tag: &U) -> TagRef {
        self.inner
            .shared
            .tags
            .create(Arc::new(tag.clone()), &tag.encode())
    }

    pub(super) fn shared(&self) -> &Arc<TopicShared> {
        &self.inner.shared
    }

    /// Create a reader or writer element bound to `binding`.
    pub(super) fn create_element(
        &self,
        kind: ElementKind,
        binding: Binding,
        config: ElementConfig,
    ) -> Result<Element<K, V, U>> {
        let core = self.core(kind)?;
        let id = core.create_element(binding, config)?;
        Ok(Element {
            topic: self.clone(),
            core,
            id,
        })
    }

    /// Binding for a key set; an empty set selects every key.
    pub(super) fn key_binding(&self, keys: &[K]) -> Result<Binding> {
        if keys.is_empty() {
            return self
                .inner
                .shared
                .key_filters
                .always_match()
                .map(Binding::Filter)
                .ok_or_else(|| Error::UnknownFilter(String::new()));
        }
        Ok(Binding::Keys(keys.iter().map(|k| self.key_ref(k)).collect()))
    }
}

impl<K, V, U> std::fmt::Debug for Topic<K, V, U> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topic")
            .field("name", &self.inner.shared.name)
            .field("node", &self.inner.instance.name)
            .finish()
    }
}

// ============================================================================
// Element handle
// ============================================================================

/// A data element owned by a typed reader or writer; destroyed on drop.
pub(super) struct Element<K, V, U> {
    pub(super) topic: Topic<K, V, U>,
    pub(super) core: Arc<TopicCore>,
    pub(super) id: i64,
}

impl<K: Key, V: Codec, U: Key> Element<K, V, U> {
    pub(super) fn with<R>(&self, f: impl FnOnce(&mut DataElement) -> R) -> Result<R> {
        if self.topic.inner.instance.is_shutdown() {
            return Err(Error::NodeShutdown);
        }
        self.core.with_element(self.id, f)
    }

    pub(super) fn name(&self) -> Result<String> {
        self.with(|e| e.name.to_string())
    }

    pub(super) fn sample(&self, sample: &CoreSample) -> Option<Sample<K, V, U>> {
        Sample::from_core(sample, self.topic.shared().values.as_ref())
    }

    pub(super) fn samples(&self, samples: &[Arc<CoreSample>]) -> Vec<Sample<K, V, U>> {
        samples.iter().filter_map(|s| self.sample(s)).collect()
    }

    pub(super) fn has_listeners(&self) -> Result<bool> {
        self.with(|e| e.listener_count() > 0)
    }

    pub(super) fn wait_for_listeners(&self, count: usize) -> Result<()> {
        self.core.wait_for_element_listeners(self.id, count)
    }

    pub(super) fn wait_for_no_listeners(&self) -> Result<()> {
        self.core.wait_for_no_element_listeners(self.id)
    }

    pub(super) fn connected_elements(&self) -> Result<Vec<String>> {
        self.with(|e| {
            e.connected_elements()
                .iter()
                .map(|n| n.to_string())
                .collect()
        })
    }

    pub(super) fn connected_keys(&self) -> Result<Vec<K>> {
        self.with(|e| e.connected_keys().iter().filter_map(typed_key::<K>).collect())
    }

    pub(super) fn on_connected_keys<I, F>(&self, init: I, update: F) -> Result<()>
    where
        I: FnOnce(Vec<K>) + Send + 'static,
        F: Fn(CallbackReason, K) + Send + Sync + 'static,
    {
        self.with(|e| {
            e.on_connected_keys(
                Box::new(move |keys: Vec<KeyRef>| {
                    init(keys.iter().filter_map(typed_key::<K>).collect())
                }),
                Arc::new(move |reason: CallbackReason, key: KeyRef| {
                    if let Some(key) = typed_key::<K>(&key) {
                        update(reason, key);
                    }
                }),
            )
        })
    }

    pub(super) fn on_connected_elements<I, F>(&self, init: I, update: F) -> Result<()>
    where
        I: FnOnce(Vec<String>) + Send + 'static,
        F: Fn(CallbackReason, String) + Send + Sync + 'static,
    {
        self.with(|e| {
            e.on_connected_elements(
                Box::new(move |names: Vec<Arc<str>>| {
                    init(names.iter().map(|n| n.to_string()).collect())
                }),
                Arc::new(move |reason: CallbackReason, name: Arc<str>| {
                    update(reason, name.to_string())
                }),
            )
        })
    }
}

impl<K, V, U> Drop for Element<K, V, U> {
    fn drop(&mut self) {
        self.core.destroy_element(self.id);
    }
}

fn typed_key<K: Clone + 'static>(key: &KeyRef) -> Option<K> {
    key.value().downcast_ref::<K>().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_codec_round_trip() {
        let codec = typed_codec::<String>();
        let value: AnyValue = Arc::new("AAPL".to_string());
        let bytes = codec.encode(&value);
        let decoded = codec.decode(&bytes).expect("decode");
        assert_eq!(decoded.downcast_ref::<String>().map(String::as_str), Some("AAPL"));
    }

    #[test]
    fn test_typed_codec_wrong_type_encodes_empty() {
        let codec = typed_codec::<u32>();
        let value: AnyValue = Arc::new("not a number".to_string());
        assert!(codec.encode(&value).is_empty());
        assert!(codec.decode(&[1, 2]).is_err());
    }
}
