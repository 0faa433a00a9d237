// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Typed readers.
//!
//! Samples reach a reader two ways: pulled from the unread queue
//! ([`next_unread`](SingleKeyReader::next_unread),
//! [`all_unread`](SingleKeyReader::all_unread)) or pushed to the callback
//! installed with [`on_samples`](SingleKeyReader::on_samples). Callbacks run
//! on the node's callback executor, never on the caller's thread.

use super::codec::Codec;
use super::filters::Filter;
use super::sample::Sample;
use super::topic::{Element, Key, Topic};
use super::{CallbackReason, ClearHistoryPolicy, DiscardPolicy, Result};
use crate::core::element::{Binding, ElementKind};
use crate::core::sample::Sample as CoreSample;
use crate::protocol::ElementConfig;
use std::sync::Arc;

/// Reader settings. Unset fields fall back to the topic's reader defaults.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReaderConfig {
    /// Name seen by writers, `<node>-<topic>-<id>` when unset.
    pub name: Option<String>,
    /// Samples kept in the reader history; negative keeps everything.
    pub sample_count: Option<i32>,
    /// Milliseconds a sample is kept; `0` forever.
    pub sample_lifetime: Option<i32>,
    pub clear_history: Option<ClearHistoryPolicy>,
    pub discard_policy: Option<DiscardPolicy>,
    /// Filter evaluated by writers before sending a sample.
    pub sample_filter: Option<Filter>,
}

impl ReaderConfig {
    pub(crate) fn into_element_config(self) -> ElementConfig {
        ElementConfig {
            name: self.name,
            sample_count: self.sample_count,
            sample_lifetime: self.sample_lifetime,
            clear_history: self.clear_history,
            discard_policy: self.discard_policy,
            sample_filter: self.sample_filter.as_ref().map(Filter::info),
            ..ElementConfig::default()
        }
    }
}

/// State shared by the reader flavours.
struct ReaderElement<K, V, U> {
    element: Element<K, V, U>,
}

impl<K: Key, V: Codec, U: Key> ReaderElement<K, V, U> {
    fn new(topic: &Topic<K, V, U>, binding: Binding, config: ReaderConfig) -> Result<Self> {
        let element =
            topic.create_element(ElementKind::Reader, binding, config.into_element_config())?;
        Ok(Self { element })
    }

    fn all_unread(&self) -> Result<Vec<Sample<K, V, U>>> {
        let unread = self.element.with(|e| e.history.take_unread())?;
        Ok(self.element.samples(&unread))
    }

    fn has_unread(&self) -> Result<bool> {
        self.element.with(|e| e.history.unread() > 0)
    }

    fn wait_for_unread(&self, count: usize) -> Result<()> {
        self.element.core.wait_for_unread(self.element.id, count)
    }

    fn next_unread(&self) -> Result<Sample<K, V, U>> {
        loop {
            let next = self.element.core.next_unread(self.element.id)?;
            if let Some(sample) = self.element.sample(&next) {
                return Ok(sample);
            }
            log::debug!("[READER] skipping sample {} without a typed key", next.id);
        }
    }

    fn on_samples<I, F>(&self, init: I, update: F) -> Result<()>
    where
        I: FnOnce(Vec<Sample<K, V, U>>) + Send + 'static,
        F: Fn(Sample<K, V, U>) + Send + Sync + 'static,
    {
        let values = self.element.topic.shared().values.clone();
        let init_values = values.clone();
        self.element.with(|e| {
            e.on_samples(
                Box::new(move |samples: Vec<Arc<CoreSample>>| {
                    init(
                        samples
                            .iter()
                            .filter_map(|s| Sample::from_core(s, init_values.as_ref()))
                            .collect(),
                    )
                }),
                Arc::new(move |sample: Arc<CoreSample>| {
                    if let Some(sample) = Sample::from_core(&sample, values.as_ref()) {
                        update(sample);
                    }
                }),
            )
        })
    }
}

macro_rules! reader_common {
    () => {
        /// Name seen by writers.
        pub fn name(&self) -> Result<String> {
            self.inner.element.name()
        }

        /// Whether a writer is attached.
        pub fn has_writers(&self) -> Result<bool> {
            self.inner.element.has_listeners()
        }

        /// Block until `count` remote writers are attached.
        pub fn wait_for_writers(&self, count: usize) -> Result<()> {
            self.inner.element.wait_for_listeners(count)
        }

        pub fn wait_for_no_writers(&self) -> Result<()> {
            self.inner.element.wait_for_no_listeners()
        }

        /// Names of the attached writers.
        pub fn connected_writers(&self) -> Result<Vec<String>> {
            self.inner.element.connected_elements()
        }

        /// Keys with at least one attached writer.
        pub fn connected_keys(&self) -> Result<Vec<K>> {
            self.inner.element.connected_keys()
        }

        /// Consume every unread sample, oldest first.
        pub fn all_unread(&self) -> Result<Vec<Sample<K, V, U>>> {
            self.inner.all_unread()
        }

        pub fn has_unread(&self) -> Result<bool> {
            self.inner.has_unread()
        }

        /// Block until at least `count` samples are unread.
        pub fn wait_for_unread(&self, count: usize) -> Result<()> {
            self.inner.wait_for_unread(count)
        }

        /// Block until a sample is unread and consume it.
        pub fn next_unread(&self) -> Result<Sample<K, V, U>> {
            self.inner.next_unread()
        }

        /// `init` runs once with the samples unread so far, `update` for
        /// every sample received afterwards.
        pub fn on_samples<I, F>(&self, init: I, update: F) -> Result<()>
        where
            I: FnOnce(Vec<Sample<K, V, U>>) + Send + 'static,
            F: Fn(Sample<K, V, U>) + Send + Sync + 'static,
        {
            self.inner.on_samples(init, update)
        }

        pub fn on_connected_writers<I, F>(&self, init: I, update: F) -> Result<()>
        where
            I: FnOnce(Vec<String>) + Send + 'static,
            F: Fn(CallbackReason, String) + Send + Sync + 'static,
        {
            self.inner.element.on_connected_elements(init, update)
        }

        pub fn on_connected_keys<I, F>(&self, init: I, update: F) -> Result<()>
        where
            I: FnOnce(Vec<K>) + Send + 'static,
            F: Fn(CallbackReason, K) + Send + Sync + 'static,
        {
            self.inner.element.on_connected_keys(init, update)
        }
    };
}

// ============================================================================
// Reader flavours
// ============================================================================

/// Reader for one key.
pub struct SingleKeyReader<K, V, U = String> {
    inner: ReaderElement<K, V, U>,
    key: K,
}

impl<K: Key, V: Codec, U: Key> SingleKeyReader<K, V, U> {
    pub fn new(topic: &Topic<K, V, U>, key: K, config: ReaderConfig) -> Result<Self> {
        let binding = topic.key_binding(std::slice::from_ref(&key))?;
        let inner = ReaderElement::new(topic, binding, config)?;
        Ok(Self { inner, key })
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    reader_common!();
}

/// Reader for a set of keys, or for any key when the set is empty.
pub struct MultiKeyReader<K, V, U = String> {
    inner: ReaderElement<K, V, U>,
}

impl<K: Key, V: Codec, U: Key> MultiKeyReader<K, V, U> {
    pub fn new(topic: &Topic<K, V, U>, keys: Vec<K>, config: ReaderConfig) -> Result<Self> {
        let binding = topic.key_binding(&keys)?;
        let inner = ReaderElement::new(topic, binding, config)?;
        Ok(Self { inner })
    }

    /// Reader for any key.
    pub fn any_key(topic: &Topic<K, V, U>, config: ReaderConfig) -> Result<Self> {
        Self::new(topic, Vec::new(), config)
    }

    reader_common!();
}

/// Reader for the keys matching a key filter registered on the topic.
pub struct FilteredKeyReader<K, V, U = String> {
    inner: ReaderElement<K, V, U>,
}

impl<K: Key, V: Codec, U: Key> FilteredKeyReader<K, V, U> {
    pub fn new(topic: &Topic<K, V, U>, filter: Filter, config: ReaderConfig) -> Result<Self> {
        let filter = topic
            .shared()
            .key_filters
            .create(&filter.name, &filter.criteria)?;
        let inner = ReaderElement::new(topic, Binding::Filter(filter), config)?;
        Ok(Self { inner })
    }

    reader_common!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SampleEvent;

    #[test]
    fn test_reader_config_conversion() {
        let config = ReaderConfig {
            sample_count: Some(3),
            discard_policy: Some(DiscardPolicy::Priority),
            sample_filter: Some(Filter::events(&[SampleEvent::Add])),
            ..Default::default()
        };
        let element = config.into_element_config();
        assert_eq!(element.sample_count, Some(3));
        assert_eq!(element.discard_policy, Some(DiscardPolicy::Priority));
        assert_eq!(element.priority, None);
        let filter = element.sample_filter.expect("sample filter");
        assert_eq!(filter.name, crate::config::EVENT_FILTER);
        assert_eq!(filter.criteria, vec![0]);
    }
}
