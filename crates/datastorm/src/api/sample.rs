// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Typed view of a sample.

use super::codec::Codec;
use crate::core::interner::ValueCodec;
use crate::core::sample::Sample as CoreSample;
use crate::protocol::SampleEvent;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// One event on one key, as seen by a reader or kept in a writer's history.
#[derive(Clone)]
pub struct Sample<K, V, U = String> {
    id: i64,
    event: SampleEvent,
    key: K,
    value: Option<V>,
    tag: Option<U>,
    timestamp: i64,
    origin: Arc<str>,
    session: Arc<str>,
}

impl<K, V, U> Sample<K, V, U>
where
    K: Clone + 'static,
    V: Codec,
    U: Clone + 'static,
{
    /// Typed copy of an engine sample; `None` if it has no key of type `K`.
    pub(crate) fn from_core(sample: &CoreSample, values: &dyn ValueCodec) -> Option<Self> {
        let key = sample
            .key
            .as_ref()
            .and_then(|k| k.value().downcast_ref::<K>().cloned())?;
        let value = sample
            .value(values)
            .and_then(|v| v.downcast_ref::<V>().cloned());
        let tag = sample
            .tag
            .as_ref()
            .and_then(|t| t.value().downcast_ref::<U>().cloned());
        Some(Self {
            id: sample.id,
            event: sample.event,
            key,
            value,
            tag,
            timestamp: sample.timestamp,
            origin: sample.origin.clone(),
            session: sample.session.clone(),
        })
    }
}

impl<K, V, U> Sample<K, V, U> {
    /// Id assigned by the writer's topic, increasing per topic.
    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn event(&self) -> SampleEvent {
        self.event
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    /// Value after the event. `None` for removals. For partial updates this
    /// is the updated value.
    pub fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }

    /// Tag of a partial update.
    pub fn update_tag(&self) -> Option<&U> {
        self.tag.as_ref()
    }

    /// Microseconds since the UNIX epoch.
    pub fn timestamp_micros(&self) -> i64 {
        self.timestamp
    }

    pub fn timestamp(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_micros(u64::try_from(self.timestamp).unwrap_or_default())
    }

    /// Name of the writer that published the sample.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Name of the node the sample was received from, empty for local samples.
    pub fn session(&self) -> &str {
        &self.session
    }
}

impl<K: fmt::Debug, V: fmt::Debug, U: fmt::Debug> fmt::Debug for Sample<K, V, U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sample")
            .field("id", &self.id)
            .field("event", &self.event)
            .field("key", &self.key)
            .field("value", &self.value)
            .field("tag", &self.tag)
            .field("origin", &self.origin)
            .finish()
    }
}
