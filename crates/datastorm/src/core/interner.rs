// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Deduplicating factories for keys, tags and filters.
//!
//! An [`Interner`] is an arena indexed by id with a reverse map from encoded
//! bytes to id. Each live [`Handle`] holds one reference; cloning retains,
//! dropping releases, and the entry is removed when the count reaches zero.
//!
//! ```text
//!  bytes ----> id ----> Entry { bytes, payload, refs }
//!                 ^
//!  Handle { id } -+  (clone: refs += 1, drop: refs -= 1, 0 => removed)
//! ```
//!
//! Ids are allocated from a per-kind process-wide counter so two factories of
//! the same kind never hand out the same id.

use crate::api::{CodecError, Error};
use crate::core::sample::Sample;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Type-erased application value.
pub(crate) type AnyValue = Arc<dyn Any + Send + Sync>;

static KEY_IDS: AtomicI64 = AtomicI64::new(0);
static TAG_IDS: AtomicI64 = AtomicI64::new(0);
// Id 1 is the always-match filter.
static FILTER_IDS: AtomicI64 = AtomicI64::new(crate::config::ALWAYS_MATCH_FILTER_ID);

/// Encodes and decodes the application values of one type.
pub(crate) trait ValueCodec: Send + Sync {
    fn encode(&self, value: &AnyValue) -> Vec<u8>;

    fn decode(&self, bytes: &[u8]) -> Result<AnyValue, CodecError>;
}

pub(crate) struct Interner<P> {
    kind: &'static str,
    counter: &'static AtomicI64,
    state: Mutex<InternerState<P>>,
}

struct InternerState<P> {
    ids: HashMap<Arc<[u8]>, i64>,
    entries: HashMap<i64, Entry<P>>,
}

struct Entry<P> {
    bytes: Arc<[u8]>,
    payload: Arc<P>,
    refs: usize,
}

impl<P> Interner<P> {
    fn new(kind: &'static str, counter: &'static AtomicI64) -> Arc<Self> {
        Arc::new(Self {
            kind,
            counter,
            state: Mutex::new(InternerState {
                ids: HashMap::new(),
                entries: HashMap::new(),
            }),
        })
    }

    /// Existing entry for `bytes`, or a new one built by `make`.
    ///
    /// `make` runs without the arena lock held; if another thread interned
    /// the same bytes meanwhile, its entry wins.
    fn intern<E>(
        self: &Arc<Self>,
        bytes: &[u8],
        make: impl FnOnce() -> Result<P, E>,
    ) -> Result<Handle<P>, E> {
        if let Some(handle) = self.lookup(bytes) {
            return Ok(handle);
        }
        let payload = Arc::new(make()?);

        let mut state = self.state.lock();
        if let Some(&id) = state.ids.get(bytes) {
            if let Some(entry) = state.entries.get_mut(&id) {
                entry.refs += 1;
                return Ok(self.handle(id, entry));
            }
        }
        let id = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let bytes: Arc<[u8]> = Arc::from(bytes);
        state.ids.insert(bytes.clone(), id);
        let entry = state.entries.entry(id).or_insert(Entry {
            bytes,
            payload,
            refs: 1,
        });
        log::trace!("[INTERN] new {} #{}", self.kind, id);
        Ok(self.handle(id, entry))
    }

    fn lookup(self: &Arc<Self>, bytes: &[u8]) -> Option<Handle<P>> {
        let mut state = self.state.lock();
        let id = *state.ids.get(bytes)?;
        let entry = state.entries.get_mut(&id)?;
        entry.refs += 1;
        Some(self.handle(id, entry))
    }

    /// Handle for a live id.
    pub(crate) fn get(self: &Arc<Self>, id: i64) -> Option<Handle<P>> {
        let mut state = self.state.lock();
        let entry = state.entries.get_mut(&id)?;
        entry.refs += 1;
        Some(self.handle(id, entry))
    }

    /// Register a reserved id outside the allocated range.
    fn pin(self: &Arc<Self>, id: i64, bytes: &[u8], payload: P) -> Handle<P> {
        let mut state = self.state.lock();
        let bytes: Arc<[u8]> = Arc::from(bytes);
        state.ids.insert(bytes.clone(), id);
        let entry = state.entries.entry(id).or_insert(Entry {
            bytes,
            payload: Arc::new(payload),
            refs: 0,
        });
        entry.refs += 1;
        self.handle(id, entry)
    }

    fn handle(self: &Arc<Self>, id: i64, entry: &Entry<P>) -> Handle<P> {
        Handle {
            id,
            bytes: entry.bytes.clone(),
            payload: entry.payload.clone(),
            owner: self.clone(),
        }
    }

    fn retain(&self, id: i64) {
        if let Some(entry) = self.state.lock().entries.get_mut(&id) {
            entry.refs += 1;
        }
    }

    fn release(&self, id: i64) {
        let mut state = self.state.lock();
        let Some(entry) = state.entries.get_mut(&id) else {
            return;
        };
        entry.refs -= 1;
        if entry.refs == 0 {
            if let Some(entry) = state.entries.remove(&id) {
                state.ids.remove(&entry.bytes);
                log::trace!("[INTERN] released {} #{}", self.kind, id);
            }
        }
    }

    /// Number of live entries.
    pub(crate) fn len(&self) -> usize {
        self.state.lock().entries.len()
    }
}

/// Counted reference to an interned entry.
pub(crate) struct Handle<P> {
    id: i64,
    bytes: Arc<[u8]>,
    payload: Arc<P>,
    owner: Arc<Interner<P>>,
}

impl<P> Handle<P> {
    pub(crate) fn id(&self) -> i64 {
        self.id
    }

    /// Encoded form the entry is deduplicated by.
    pub(crate) fn encoded(&self) -> &[u8] {
        &self.bytes
    }

    pub(crate) fn payload(&self) -> &P {
        &self.payload
    }
}

impl<P> Clone for Handle<P> {
    fn clone(&self) -> Self {
        self.owner.retain(self.id);
        Self {
            id: self.id,
            bytes: self.bytes.clone(),
            payload: self.payload.clone(),
            owner: self.owner.clone(),
        }
    }
}

impl<P> Drop for Handle<P> {
    fn drop(&mut self) {
        self.owner.release(self.id);
    }
}

impl<P> PartialEq for Handle<P> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Arc::ptr_eq(&self.owner, &other.owner)
    }
}

impl<P> Eq for Handle<P> {}

impl<P> Hash for Handle<P> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<P> PartialOrd for Handle<P> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<P> Ord for Handle<P> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}

impl<P> fmt::Debug for Handle<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.owner.kind, self.id)
    }
}

// ============================================================================
// Keys and tags
// ============================================================================

pub(crate) type KeyRef = Handle<AnyValue>;
pub(crate) type TagRef = Handle<AnyValue>;

impl Handle<AnyValue> {
    pub(crate) fn value(&self) -> &AnyValue {
        &self.payload
    }
}

/// Factory of keys (or tags) of one application type.
pub(crate) struct ValueFactory {
    interner: Arc<Interner<AnyValue>>,
    codec: Arc<dyn ValueCodec>,
}

impl ValueFactory {
    pub(crate) fn keys(codec: Arc<dyn ValueCodec>) -> Self {
        Self {
            interner: Interner::new("key", &KEY_IDS),
            codec,
        }
    }

    pub(crate) fn tags(codec: Arc<dyn ValueCodec>) -> Self {
        Self {
            interner: Interner::new("tag", &TAG_IDS),
            codec,
        }
    }

    /// Intern a value whose encoded form is already known.
    pub(crate) fn create(&self, value: AnyValue, encoded: &[u8]) -> KeyRef {
        match self
            .interner
            .intern::<std::convert::Infallible>(encoded, || Ok(value))
        {
            Ok(handle) => handle,
            Err(never) => match never {},
        }
    }

    pub(crate) fn decode(&self, encoded: &[u8]) -> Result<KeyRef, CodecError> {
        self.interner
            .intern(encoded, || self.codec.decode(encoded))
    }

    pub(crate) fn get(&self, id: i64) -> Option<KeyRef> {
        self.interner.get(id)
    }

    pub(crate) fn codec(&self) -> &Arc<dyn ValueCodec> {
        &self.codec
    }

    pub(crate) fn len(&self) -> usize {
        self.interner.len()
    }
}

// ============================================================================
// Filters
// ============================================================================

pub(crate) type KeyPredicate = Arc<dyn Fn(&AnyValue) -> bool + Send + Sync>;
pub(crate) type SamplePredicate = Arc<dyn Fn(&Sample) -> bool + Send + Sync>;

pub(crate) enum Predicate {
    Always,
    Key(KeyPredicate),
    Sample(SamplePredicate),
}

/// Builds a predicate from encoded criteria.
pub(crate) type FilterConstructor = Arc<dyn Fn(&[u8]) -> Result<Predicate, Error> + Send + Sync>;

pub(crate) struct FilterSpec {
    pub(crate) name: String,
    pub(crate) criteria: Vec<u8>,
    predicate: Predicate,
}

pub(crate) type FilterRef = Handle<FilterSpec>;

impl Handle<FilterSpec> {
    pub(crate) fn name(&self) -> &str {
        &self.payload.name
    }

    pub(crate) fn criteria(&self) -> &[u8] {
        &self.payload.criteria
    }

    pub(crate) fn is_always(&self) -> bool {
        matches!(self.payload.predicate, Predicate::Always)
    }

    pub(crate) fn matches_key(&self, key: &KeyRef) -> bool {
        match &self.payload.predicate {
            Predicate::Always => true,
            Predicate::Key(f) => f(key.value()),
            Predicate::Sample(_) => false,
        }
    }

    pub(crate) fn matches_sample(&self, sample: &Sample) -> bool {
        match &self.payload.predicate {
            Predicate::Always => true,
            Predicate::Sample(f) => f(sample),
            Predicate::Key(f) => sample.key.as_ref().is_some_and(|k| f(k.value())),
        }
    }

    /// Whether a remote filter and a local filter select the same elements.
    pub(crate) fn matches_filter(&self, other: &FilterRef) -> bool {
        self.is_always() || other.is_always() || self == other
    }
}

/// Factory of named key filters or sample filters.
pub(crate) struct FilterFactory {
    interner: Arc<Interner<FilterSpec>>,
    constructors: RwLock<HashMap<String, FilterConstructor>>,
    always: Option<FilterRef>,
}

impl FilterFactory {
    /// Key filter factory, holding the always-match filter.
    pub(crate) fn key_filters() -> Self {
        let interner = Interner::new("key filter", &FILTER_IDS);
        let always = interner.pin(
            crate::config::ALWAYS_MATCH_FILTER_ID,
            &[],
            FilterSpec {
                name: String::new(),
                criteria: Vec::new(),
                predicate: Predicate::Always,
            },
        );
        Self {
            interner,
            constructors: RwLock::new(HashMap::new()),
            always: Some(always),
        }
    }

    pub(crate) fn sample_filters() -> Self {
        Self {
            interner: Interner::new("sample filter", &FILTER_IDS),
            constructors: RwLock::new(HashMap::new()),
            always: None,
        }
    }

    pub(crate) fn register(&self, name: &str, constructor: FilterConstructor) {
        self.constructors
            .write()
            .insert(name.to_string(), constructor);
    }

    pub(crate) fn always_match(&self) -> Option<FilterRef> {
        self.always.clone()
    }

    /// Filter for `name` and `criteria`; an empty name and criteria denote
    /// the always-match filter.
    pub(crate) fn create(&self, name: &str, criteria: &[u8]) -> Result<FilterRef, Error> {
        if name.is_empty() && criteria.is_empty() {
            if let Some(always) = &self.always {
                return Ok(always.clone());
            }
        }
        let constructor = self
            .constructors
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownFilter(name.to_string()))?;

        let mut bytes = Vec::with_capacity(name.len() + 1 + criteria.len());
        bytes.extend_from_slice(name.as_bytes());
        bytes.push(0);
        bytes.extend_from_slice(criteria);

        self.interner.intern(&bytes, || {
            Ok(FilterSpec {
                name: name.to_string(),
                criteria: criteria.to_vec(),
                predicate: constructor(criteria)?,
            })
        })
    }

    pub(crate) fn get(&self, id: i64) -> Option<FilterRef> {
        self.interner.get(id)
    }
}
