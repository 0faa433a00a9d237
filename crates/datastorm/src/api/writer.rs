// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Typed writers.

use super::codec::Codec;
use super::sample::Sample;
use super::topic::{Element, Key, Topic};
use super::{CallbackReason, ClearHistoryPolicy, Error, Result};
use crate::core::element::ElementKind;
use crate::core::interner::AnyValue;
use crate::protocol::{ElementConfig, SampleEvent};
use std::sync::Arc;

/// Writer settings. Unset fields fall back to the topic's writer defaults.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WriterConfig {
    /// Name seen by readers, `<node>-<topic>-<id>` when unset.
    pub name: Option<String>,
    /// Readers with [`DiscardPolicy::Priority`](super::DiscardPolicy::Priority)
    /// drop samples from writers below the highest connected priority.
    pub priority: Option<i32>,
    /// Samples kept for late joiners; negative keeps everything, `0` nothing.
    pub sample_count: Option<i32>,
    /// Milliseconds a sample is kept for late joiners; `0` forever.
    pub sample_lifetime: Option<i32>,
    pub clear_history: Option<ClearHistoryPolicy>,
}

impl WriterConfig {
    pub(crate) fn into_element_config(self) -> ElementConfig {
        ElementConfig {
            name: self.name,
            priority: self.priority,
            sample_count: self.sample_count,
            sample_lifetime: self.sample_lifetime,
            clear_history: self.clear_history,
            ..ElementConfig::default()
        }
    }
}

/// State shared by the writer flavours.
struct WriterElement<K, V, U> {
    element: Element<K, V, U>,
}

impl<K: Key, V: Codec, U: Key> WriterElement<K, V, U> {
    fn new(topic: &Topic<K, V, U>, keys: &[K], config: WriterConfig) -> Result<Self> {
        let binding = topic.key_binding(keys)?;
        let element =
            topic.create_element(ElementKind::Writer, binding, config.into_element_config())?;
        Ok(Self { element })
    }

    fn publish(&self, key: &K, event: SampleEvent, value: Option<V>) -> Result<()> {
        let key = self.element.topic.key_ref(key);
        let encoded = value.as_ref().map(Codec::encode).unwrap_or_default();
        let value = value.map(|v| Arc::new(v) as AnyValue);
        self.element
            .core
            .publish(self.element.id, Some(key), event, encoded, value, None)
    }

    fn partial_update<W: Codec>(&self, key: &K, tag: &U, change: &W) -> Result<()> {
        let tag_ref = self.element.topic.tag_ref(tag);
        if self.element.topic.shared().updater(tag_ref.id()).is_none() {
            return Err(Error::UnknownUpdater(tag.to_string()));
        }
        let key = self.element.topic.key_ref(key);
        self.element.core.publish(
            self.element.id,
            Some(key),
            SampleEvent::PartialUpdate,
            change.encode(),
            None,
            Some(tag_ref),
        )
    }

    fn last(&self) -> Result<Option<Sample<K, V, U>>> {
        let last = self.element.with(|e| e.history.last().cloned())?;
        Ok(last.and_then(|s| self.element.sample(&s)))
    }

    fn all(&self) -> Result<Vec<Sample<K, V, U>>> {
        let all = self.element.with(|e| e.history.all())?;
        Ok(self.element.samples(&all))
    }
}

macro_rules! writer_common {
    () => {
        /// Name seen by readers.
        pub fn name(&self) -> Result<String> {
            self.inner.element.name()
        }

        /// Whether a reader is attached.
        pub fn has_readers(&self) -> Result<bool> {
            self.inner.element.has_listeners()
        }

        /// Block until `count` remote readers are attached.
        pub fn wait_for_readers(&self, count: usize) -> Result<()> {
            self.inner.element.wait_for_listeners(count)
        }

        pub fn wait_for_no_readers(&self) -> Result<()> {
            self.inner.element.wait_for_no_listeners()
        }

        /// Names of the attached readers.
        pub fn connected_readers(&self) -> Result<Vec<String>> {
            self.inner.element.connected_elements()
        }

        /// Keys with at least one attached reader.
        pub fn connected_keys(&self) -> Result<Vec<K>> {
            self.inner.element.connected_keys()
        }

        /// Last sample written, if still in the history.
        pub fn last(&self) -> Result<Option<Sample<K, V, U>>> {
            self.inner.last()
        }

        /// Samples kept for late joiners, oldest first.
        pub fn all(&self) -> Result<Vec<Sample<K, V, U>>> {
            self.inner.all()
        }

        /// `init` runs once with the readers attached so far, `update` on
        /// every later attach or detach.
        pub fn on_connected_readers<I, F>(&self, init: I, update: F) -> Result<()>
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
// SingleKeyWriter
// ============================================================================

/// Writer for one key.
pub struct SingleKeyWriter<K, V, U = String> {
    inner: WriterElement<K, V, U>,
    key: K,
}

impl<K: Key, V: Codec, U: Key> SingleKeyWriter<K, V, U> {
    pub fn new(topic: &Topic<K, V, U>, key: K) -> Result<Self> {
        Self::with_config(topic, key, WriterConfig::default())
    }

    pub fn with_config(topic: &Topic<K, V, U>, key: K, config: WriterConfig) -> Result<Self> {
        let inner = WriterElement::new(topic, std::slice::from_ref(&key), config)?;
        Ok(Self { inner, key })
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn add(&self, value: V) -> Result<()> {
        self.inner.publish(&self.key, SampleEvent::Add, Some(value))
    }

    pub fn update(&self, value: V) -> Result<()> {
        self.inner.publish(&self.key, SampleEvent::Update, Some(value))
    }

    /// Publish `change`, applied to the current value by the updater
    /// registered for `tag`.
    pub fn partial_update<W: Codec>(&self, tag: &U, change: &W) -> Result<()> {
        self.inner.partial_update(&self.key, tag, change)
    }

    pub fn remove(&self) -> Result<()> {
        self.inner.publish(&self.key, SampleEvent::Remove, None)
    }

    writer_common!();
}

// ============================================================================
// MultiKeyWriter
// ============================================================================

/// Writer for a set of keys, or for any key when the set is empty.
pub struct MultiKeyWriter<K, V, U = String> {
    inner: WriterElement<K, V, U>,
    keys: Vec<K>,
}

impl<K: Key, V: Codec, U: Key> MultiKeyWriter<K, V, U> {
    pub fn new(topic: &Topic<K, V, U>, keys: Vec<K>) -> Result<Self> {
        Self::with_config(topic, keys, WriterConfig::default())
    }

    pub fn with_config(topic: &Topic<K, V, U>, keys: Vec<K>, config: WriterConfig) -> Result<Self> {
        let inner = WriterElement::new(topic, &keys, config)?;
        Ok(Self { inner, keys })
    }

    /// Writer for any key.
    pub fn any_key(topic: &Topic<K, V, U>) -> Result<Self> {
        Self::new(topic, Vec::new())
    }

    fn check(&self, key: &K) -> Result<()> {
        if self.keys.is_empty() || self.keys.contains(key) {
            Ok(())
        } else {
            Err(Error::InvalidArgument(format!("key {} is not written by this writer", key)))
        }
    }

    pub fn add(&self, key: &K, value: V) -> Result<()> {
        self.check(key)?;
        self.inner.publish(key, SampleEvent::Add, Some(value))
    }

    pub fn update(&self, key: &K, value: V) -> Result<()> {
        self.check(key)?;
        self.inner.publish(key, SampleEvent::Update, Some(value))
    }

    pub fn partial_update<W: Codec>(&self, key: &K, tag: &U, change: &W) -> Result<()> {
        self.check(key)?;
        self.inner.partial_update(key, tag, change)
    }

    pub fn remove(&self, key: &K) -> Result<()> {
        self.check(key)?;
        self.inner.publish(key, SampleEvent::Remove, None)
    }

    writer_common!();
}
