// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sample history with retention and replay.
//!
//! # Retention (applied on every publish/queue)
//!
//! 1. clear-history: wipe the whole history if the policy matches the new
//!    sample's event
//! 2. append (skipped when `sample_count == 0`)
//! 3. evict samples older than `now - sample_lifetime`
//! 4. cap to `sample_count` samples, oldest first
//!
//! # Replay
//!
//! [`History::replay`] walks newest to oldest and stops at the first sample
//! that is stale for the peer, already seen by the peer, beyond the peer's
//! sample count, or a clear-history event for the peer's policy.

use crate::core::interner::{FilterRef, KeyRef, ValueCodec};
use crate::core::sample::Sample;
use crate::protocol::{ClearHistoryPolicy, DataSample, ElementConfig, SampleEvent};
use std::collections::VecDeque;
use std::sync::Arc;

/// Resolved retention settings of an element.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Retention {
    pub(crate) sample_count: i32,
    /// Milliseconds, `<= 0` keeps samples forever.
    pub(crate) sample_lifetime: i32,
    pub(crate) clear_history: ClearHistoryPolicy,
}

impl Retention {
    pub(crate) fn from_config(config: &ElementConfig) -> Self {
        Self {
            sample_count: config
                .sample_count
                .unwrap_or(crate::config::DEFAULT_SAMPLE_COUNT),
            sample_lifetime: config
                .sample_lifetime
                .unwrap_or(crate::config::DEFAULT_SAMPLE_LIFETIME_MS),
            clear_history: config
                .clear_history
                .unwrap_or(crate::config::DEFAULT_CLEAR_HISTORY),
        }
    }

    /// Oldest timestamp still retained at `now`.
    fn cutoff(&self, now: i64) -> Option<i64> {
        (self.sample_lifetime > 0).then(|| now - i64::from(self.sample_lifetime) * 1000)
    }
}

/// Samples of one element, oldest first. The newest `unread` samples have
/// not been consumed by the application yet (readers only).
#[derive(Default)]
pub(crate) struct History {
    samples: VecDeque<Arc<Sample>>,
    unread: usize,
}

/// What a peer asks for when it attaches to a writer.
pub(crate) struct ReplayRequest<'a> {
    pub(crate) key: Option<&'a KeyRef>,
    pub(crate) key_filter: Option<&'a FilterRef>,
    pub(crate) sample_filter: Option<&'a FilterRef>,
    pub(crate) peer: &'a ElementConfig,
    pub(crate) last_id: i64,
    pub(crate) now: i64,
}

impl History {
    pub(crate) fn len(&self) -> usize {
        self.samples.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub(crate) fn unread(&self) -> usize {
        self.unread
    }

    pub(crate) fn last(&self) -> Option<&Arc<Sample>> {
        self.samples.back()
    }

    pub(crate) fn all(&self) -> Vec<Arc<Sample>> {
        self.samples.iter().cloned().collect()
    }

    /// Unread samples, oldest first, without consuming them.
    pub(crate) fn peek_unread(&self) -> Vec<Arc<Sample>> {
        let start = self.samples.len() - self.unread;
        self.samples.range(start..).cloned().collect()
    }

    /// Consume every unread sample.
    pub(crate) fn take_unread(&mut self) -> Vec<Arc<Sample>> {
        let unread = self.peek_unread();
        self.unread = 0;
        unread
    }

    /// Consume the oldest unread sample.
    pub(crate) fn next_unread(&mut self) -> Option<Arc<Sample>> {
        if self.unread == 0 {
            return None;
        }
        let sample = self.samples.get(self.samples.len() - self.unread).cloned();
        self.unread -= 1;
        sample
    }

    /// Apply retention and append `sample`. Returns `false` if the sample was
    /// not retained.
    pub(crate) fn push(
        &mut self,
        sample: Arc<Sample>,
        retention: &Retention,
        now: i64,
        unread: bool,
    ) -> bool {
        if retention.clear_history.clears_on(sample.event) {
            self.samples.clear();
            self.unread = 0;
        }
        let retained = retention.sample_count != 0;
        if retained {
            self.samples.push_back(sample);
            if unread {
                self.unread += 1;
            }
        }
        self.evict(retention, now);
        retained
    }

    /// Drop expired samples and cap the history length.
    pub(crate) fn evict(&mut self, retention: &Retention, now: i64) {
        if let Some(cutoff) = retention.cutoff(now) {
            while self.samples.front().is_some_and(|s| s.timestamp < cutoff) {
                self.pop_front();
            }
        }
        if retention.sample_count > 0 {
            let max = retention.sample_count as usize;
            while self.samples.len() > max {
                self.pop_front();
            }
        }
    }

    fn pop_front(&mut self) {
        if self.samples.pop_front().is_some() && self.unread > self.samples.len() {
            self.unread = self.samples.len();
        }
    }

    /// Samples a newly attached peer has not seen yet, oldest first.
    pub(crate) fn replay(&self, request: &ReplayRequest<'_>) -> Vec<Arc<Sample>> {
        let peer = Retention::from_config(request.peer);
        if peer.sample_count == 0 {
            return Vec::new();
        }
        let cutoff = peer.cutoff(request.now);

        let mut samples = VecDeque::new();
        for sample in self.samples.iter().rev() {
            if cutoff.is_some_and(|cutoff| sample.timestamp < cutoff) {
                break;
            }
            if sample.id <= request.last_id {
                break;
            }
            if !matches_request(sample, request) {
                continue;
            }
            samples.push_front(sample.clone());
            if peer.sample_count > 0 && samples.len() >= peer.sample_count as usize {
                break;
            }
            if peer.clear_history.clears_on(sample.event) {
                break;
            }
        }
        samples.into()
    }
}

fn matches_request(sample: &Sample, request: &ReplayRequest<'_>) -> bool {
    if let Some(key) = request.key {
        if sample.key.as_ref() != Some(key) {
            return false;
        }
    } else if let Some(filter) = request.key_filter {
        if !sample.key.as_ref().is_some_and(|k| filter.matches_key(k)) {
            return false;
        }
    }
    request
        .sample_filter
        .map_or(true, |filter| filter.matches_sample(sample))
}

/// Wire form of replayed samples. A leading partial update is sent as a full
/// update: the peer has no baseline to apply it to.
pub(crate) fn to_wire(
    samples: &[Arc<Sample>],
    with_key_value: bool,
    codec: &dyn ValueCodec,
) -> Vec<DataSample> {
    samples
        .iter()
        .enumerate()
        .map(|(index, sample)| {
            let as_update = index == 0 && sample.event == SampleEvent::PartialUpdate;
            sample.to_data_sample(with_key_value, as_update, codec)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::CodecError;
    use crate::core::interner::{AnyValue, ValueFactory};

    struct I64Codec;

    impl ValueCodec for I64Codec {
        fn encode(&self, value: &AnyValue) -> Vec<u8> {
            value
                .downcast_ref::<i64>()
                .map(|v| v.to_le_bytes().to_vec())
                .unwrap_or_default()
        }

        fn decode(&self, bytes: &[u8]) -> Result<AnyValue, CodecError> {
            let raw: [u8; 8] = bytes
                .try_into()
                .map_err(|_| CodecError::new("expected 8 bytes"))?;
            Ok(Arc::new(i64::from_le_bytes(raw)))
        }
    }

    fn keys() -> ValueFactory {
        ValueFactory::keys(Arc::new(I64Codec))
    }

    fn sample(id: i64, event: SampleEvent, key: &KeyRef, timestamp: i64) -> Arc<Sample> {
        Arc::new(Sample::new(
            id,
            event,
            Some(key.clone()),
            None,
            timestamp,
            Arc::from("w"),
            Arc::from(""),
            Arc::from(id.to_le_bytes().as_slice()),
        ))
    }

    fn retention(sample_count: i32, sample_lifetime: i32, clear: ClearHistoryPolicy) -> Retention {
        Retention {
            sample_count,
            sample_lifetime,
            clear_history: clear,
        }
    }

    fn ids(samples: &[Arc<Sample>]) -> Vec<i64> {
        samples.iter().map(|s| s.id).collect()
    }

    #[test]
    fn test_sample_count_caps_history() {
        let keys = keys();
        let k = keys.create(Arc::new(1i64), &1i64.to_le_bytes());
        let keep3 = retention(3, 0, ClearHistoryPolicy::Never);
        let mut history = History::default();
        for id in 1..=5 {
            history.push(sample(id, SampleEvent::Add, &k, id), &keep3, 5, true);
            assert!(history.len() <= 3);
        }
        assert_eq!(ids(&history.all()), vec![3, 4, 5]);
        assert_eq!(history.unread(), 3);
    }

    #[test]
    fn test_zero_sample_count_disables_history() {
        let keys = keys();
        let k = keys.create(Arc::new(1i64), &1i64.to_le_bytes());
        let mut history = History::default();
        let retained = history.push(
            sample(1, SampleEvent::Add, &k, 1),
            &retention(0, 0, ClearHistoryPolicy::Never),
            1,
            true,
        );
        assert!(!retained);
        assert!(history.is_empty());
        assert_eq!(history.unread(), 0);
    }

    #[test]
    fn test_lifetime_evicts_old_samples() {
        let keys = keys();
        let k = keys.create(Arc::new(1i64), &1i64.to_le_bytes());
        // 10ms lifetime, timestamps in microseconds
        let policy = retention(-1, 10, ClearHistoryPolicy::Never);
        let mut history = History::default();
        history.push(sample(1, SampleEvent::Add, &k, 0), &policy, 0, true);
        history.push(sample(2, SampleEvent::Update, &k, 5_000), &policy, 5_000, true);
        history.push(sample(3, SampleEvent::Update, &k, 15_000), &policy, 15_000, true);

        assert_eq!(ids(&history.all()), vec![2, 3]);
        assert!(history
            .all()
            .iter()
            .all(|s| 15_000 - s.timestamp <= 10_000));
    }

    #[test]
    fn test_clear_on_add_wipes_every_key() {
        let keys = keys();
        let a = keys.create(Arc::new(1i64), &1i64.to_le_bytes());
        let b = keys.create(Arc::new(2i64), &2i64.to_le_bytes());
        let policy = retention(-1, 0, ClearHistoryPolicy::OnAdd);
        let mut history = History::default();
        history.push(sample(1, SampleEvent::Add, &a, 1), &policy, 1, true);
        history.push(sample(2, SampleEvent::Update, &a, 2), &policy, 2, true);
        assert_eq!(ids(&history.all()), vec![1, 2]);

        history.push(sample(3, SampleEvent::Add, &b, 3), &policy, 3, true);
        assert_eq!(ids(&history.all()), vec![3]);
        history.push(sample(4, SampleEvent::Update, &b, 4), &policy, 4, true);
        history.push(sample(5, SampleEvent::Add, &a, 5), &policy, 5, true);
        assert_eq!(ids(&history.all()), vec![5]);
        assert_eq!(history.unread(), 1);
    }

    #[test]
    fn test_clear_on_remove_keeps_history_until_remove() {
        let keys = keys();
        let a = keys.create(Arc::new(1i64), &1i64.to_le_bytes());
        let b = keys.create(Arc::new(2i64), &2i64.to_le_bytes());
        let policy = retention(-1, 0, ClearHistoryPolicy::OnRemove);
        let mut history = History::default();
        history.push(sample(1, SampleEvent::Add, &a, 1), &policy, 1, false);
        history.push(sample(2, SampleEvent::Add, &b, 2), &policy, 2, false);
        history.push(sample(3, SampleEvent::Update, &a, 3), &policy, 3, false);
        assert_eq!(ids(&history.all()), vec![1, 2, 3]);

        history.push(sample(4, SampleEvent::Remove, &b, 4), &policy, 4, false);
        assert_eq!(ids(&history.all()), vec![4]);
    }

    #[test]
    fn test_unread_tracking() {
        let keys = keys();
        let k = keys.create(Arc::new(1i64), &1i64.to_le_bytes());
        let policy = retention(-1, 0, ClearHistoryPolicy::Never);
        let mut history = History::default();
        for id in 1..=3 {
            history.push(sample(id, SampleEvent::Add, &k, id), &policy, id, true);
        }
        assert_eq!(history.next_unread().map(|s| s.id), Some(1));
        assert_eq!(ids(&history.peek_unread()), vec![2, 3]);
        assert_eq!(ids(&history.take_unread()), vec![2, 3]);
        assert_eq!(history.unread(), 0);
        assert!(history.next_unread().is_none());
        assert_eq!(history.len(), 3);
    }

    #[test]
    fn test_eviction_of_unread_samples() {
        let keys = keys();
        let k = keys.create(Arc::new(1i64), &1i64.to_le_bytes());
        let policy = retention(2, 0, ClearHistoryPolicy::Never);
        let mut history = History::default();
        for id in 1..=4 {
            history.push(sample(id, SampleEvent::Add, &k, id), &policy, id, true);
        }
        assert_eq!(history.unread(), 2);
        assert_eq!(ids(&history.take_unread()), vec![3, 4]);
    }

    #[test]
    fn test_replay_stops_at_last_id_and_count() {
        let keys = keys();
        let k = keys.create(Arc::new(1i64), &1i64.to_le_bytes());
        let policy = retention(-1, 0, ClearHistoryPolicy::Never);
        let mut history = History::default();
        for id in 1..=5 {
            history.push(sample(id, SampleEvent::Add, &k, id), &policy, id, false);
        }

        let peer = ElementConfig {
            sample_count: Some(3),
            clear_history: Some(ClearHistoryPolicy::Never),
            ..Default::default()
        };
        let request = ReplayRequest {
            key: Some(&k),
            key_filter: None,
            sample_filter: None,
            peer: &peer,
            last_id: 0,
            now: 5,
        };
        assert_eq!(ids(&history.replay(&request)), vec![3, 4, 5]);

        let request = ReplayRequest {
            last_id: 4,
            ..request
        };
        assert_eq!(ids(&history.replay(&request)), vec![5]);
    }

    #[test]
    fn test_replay_stops_at_peer_clear_event() {
        let keys = keys();
        let k = keys.create(Arc::new(1i64), &1i64.to_le_bytes());
        let policy = retention(-1, 0, ClearHistoryPolicy::Never);
        let mut history = History::default();
        history.push(sample(1, SampleEvent::Update, &k, 1), &policy, 1, false);
        history.push(sample(2, SampleEvent::Add, &k, 2), &policy, 2, false);
        history.push(sample(3, SampleEvent::Update, &k, 3), &policy, 3, false);

        let peer = ElementConfig {
            sample_count: Some(-1),
            clear_history: Some(ClearHistoryPolicy::OnAdd),
            ..Default::default()
        };
        let request = ReplayRequest {
            key: None,
            key_filter: None,
            sample_filter: None,
            peer: &peer,
            last_id: 0,
            now: 3,
        };
        assert_eq!(ids(&history.replay(&request)), vec![2, 3]);
    }

    #[test]
    fn test_replay_skips_other_keys_and_stale_samples() {
        let keys = keys();
        let a = keys.create(Arc::new(1i64), &1i64.to_le_bytes());
        let b = keys.create(Arc::new(2i64), &2i64.to_le_bytes());
        let policy = retention(-1, 0, ClearHistoryPolicy::Never);
        let mut history = History::default();
        history.push(sample(1, SampleEvent::Add, &a, 1_000), &policy, 0, false);
        history.push(sample(2, SampleEvent::Add, &a, 50_000), &policy, 0, false);
        history.push(sample(3, SampleEvent::Add, &b, 60_000), &policy, 0, false);
        history.push(sample(4, SampleEvent::Update, &a, 70_000), &policy, 0, false);

        // 30ms lifetime at t=70ms: sample 1 is stale
        let peer = ElementConfig {
            sample_lifetime: Some(30),
            clear_history: Some(ClearHistoryPolicy::Never),
            ..Default::default()
        };
        let request = ReplayRequest {
            key: Some(&a),
            key_filter: None,
            sample_filter: None,
            peer: &peer,
            last_id: 0,
            now: 70_000,
        };
        assert_eq!(ids(&history.replay(&request)), vec![2, 4]);
    }

    #[test]
    fn test_leading_partial_update_sent_as_update() {
        let keys = keys();
        let k = keys.create(Arc::new(1i64), &1i64.to_le_bytes());
        let partial = Sample::new(
            7,
            SampleEvent::PartialUpdate,
            Some(k.clone()),
            None,
            7,
            Arc::from("w"),
            Arc::from(""),
            Arc::from(1i64.to_le_bytes().as_slice()),
        )
        .with_value(Arc::new(42i64));
        let samples = vec![Arc::new(partial), sample(8, SampleEvent::Update, &k, 8)];

        let wire = to_wire(&samples, true, &I64Codec);
        assert_eq!(wire[0].event, SampleEvent::Update);
        assert_eq!(wire[0].value, 42i64.to_le_bytes().to_vec());
        assert_eq!(wire[0].tag, 0);
        assert_eq!(wire[0].key_value, 1i64.to_le_bytes().to_vec());
        assert_eq!(wire[1].event, SampleEvent::Update);
        assert_eq!(wire[1].id, 8);
    }
}
