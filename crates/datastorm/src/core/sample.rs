// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Engine-side sample record.

use super::interner::{AnyValue, KeyRef, TagRef, ValueCodec};
use crate::protocol::{DataSample, SampleEvent};
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

/// One event on one key.
///
/// Immutable once queued. The decoded value is filled lazily and, for
/// partial updates, holds the materialized value (baseline with the update
/// applied) while `encoded` keeps the encoded update.
pub(crate) struct Sample {
    pub(crate) id: i64,
    pub(crate) event: SampleEvent,
    pub(crate) key: Option<KeyRef>,
    pub(crate) tag: Option<TagRef>,
    /// Microseconds since the UNIX epoch.
    pub(crate) timestamp: i64,
    /// Name of the writer element that produced the sample.
    pub(crate) origin: Arc<str>,
    /// Id of the session the sample arrived on, empty for local samples.
    pub(crate) session: Arc<str>,
    pub(crate) encoded: Arc<[u8]>,
    value: OnceLock<AnyValue>,
}

impl Sample {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: i64,
        event: SampleEvent,
        key: Option<KeyRef>,
        tag: Option<TagRef>,
        timestamp: i64,
        origin: Arc<str>,
        session: Arc<str>,
        encoded: Arc<[u8]>,
    ) -> Self {
        Self {
            id,
            event,
            key,
            tag,
            timestamp,
            origin,
            session,
            encoded,
            value: OnceLock::new(),
        }
    }

    pub(crate) fn with_value(self, value: AnyValue) -> Self {
        let _ = self.value.set(value);
        self
    }

    /// Decoded value, `None` for removals or when decoding failed.
    pub(crate) fn value(&self, codec: &dyn ValueCodec) -> Option<&AnyValue> {
        if let Some(value) = self.value.get() {
            return Some(value);
        }
        if self.event == SampleEvent::Remove || self.event == SampleEvent::PartialUpdate {
            return None;
        }
        match codec.decode(&self.encoded) {
            Ok(value) => Some(self.value.get_or_init(|| value)),
            Err(e) => {
                log::debug!("[SAMPLE] failed to decode value of sample {}: {}", self.id, e);
                None
            }
        }
    }

    /// Value already decoded or materialized.
    pub(crate) fn decoded(&self) -> Option<&AnyValue> {
        self.value.get()
    }

    /// Wire form. Partial updates are rewritten as full updates when
    /// `as_update` is set, using the materialized value.
    pub(crate) fn to_data_sample(
        &self,
        with_key_value: bool,
        as_update: bool,
        codec: &dyn ValueCodec,
    ) -> DataSample {
        let (event, value, tag) = match (self.event, as_update, self.decoded()) {
            (SampleEvent::PartialUpdate, true, Some(full)) => {
                (SampleEvent::Update, codec.encode(full), 0)
            }
            _ => (
                self.event,
                self.encoded.to_vec(),
                self.tag.as_ref().map_or(0, |t| t.id()),
            ),
        };
        DataSample {
            id: self.id,
            key_id: self.key.as_ref().map_or(0, |k| k.id()),
            key_value: match (&self.key, with_key_value) {
                (Some(key), true) => key.encoded().to_vec(),
                _ => Vec::new(),
            },
            timestamp: self.timestamp,
            tag,
            event,
            value,
        }
    }
}

impl std::fmt::Debug for Sample {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sample")
            .field("id", &self.id)
            .field("event", &self.event)
            .field("key", &self.key)
            .field("timestamp", &self.timestamp)
            .field("origin", &self.origin)
            .finish()
    }
}

/// Current time in microseconds since the UNIX epoch.
pub(crate) fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_micros() as i64)
}
