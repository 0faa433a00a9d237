// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Key and sample filters.
//!
//! A filter travels to peers as a name plus encoded criteria; each side
//! builds the predicate from the factory registered under that name on its
//! own topic. Every topic registers:
//!
//! - `_regex` (key filter): regular expression over the key's display string,
//! - `_event` (sample filter): set of sample events.
//!
//! ```rust,ignore
//! let reader = FilteredKeyReader::new(&topic, Filter::regex("^AA"), ReaderConfig {
//!     sample_filter: Some(Filter::events(&[SampleEvent::Add, SampleEvent::Update])),
//!     ..Default::default()
//! })?;
//! ```

use super::codec::Codec;
use super::sample::Sample;
use super::{Error, Result};
use crate::config::{EVENT_FILTER, REGEX_FILTER};
use crate::core::interner::{AnyValue, FilterConstructor, Predicate};
use crate::core::sample::Sample as CoreSample;
use crate::protocol::{FilterInfo, SampleEvent};
use regex::Regex;
use std::fmt::Display;
use std::sync::Arc;

/// Named filter with encoded criteria.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Filter {
    pub name: String,
    pub criteria: Vec<u8>,
}

impl Filter {
    pub fn new<C: Codec>(name: impl Into<String>, criteria: &C) -> Self {
        Self {
            name: name.into(),
            criteria: criteria.encode(),
        }
    }

    /// `_regex` filter: keys (or, as a sample filter, values) whose display
    /// string matches `pattern`.
    pub fn regex(pattern: &str) -> Self {
        Self {
            name: REGEX_FILTER.to_string(),
            criteria: pattern.as_bytes().to_vec(),
        }
    }

    /// `_event` sample filter: samples whose event is in `events`.
    pub fn events(events: &[SampleEvent]) -> Self {
        Self {
            name: EVENT_FILTER.to_string(),
            criteria: events.iter().map(|e| event_code(*e)).collect(),
        }
    }

    pub(crate) fn info(&self) -> FilterInfo {
        FilterInfo {
            name: self.name.clone(),
            criteria: self.criteria.clone(),
        }
    }
}

fn event_code(event: SampleEvent) -> u8 {
    match event {
        SampleEvent::Add => 0,
        SampleEvent::Update => 1,
        SampleEvent::PartialUpdate => 2,
        SampleEvent::Remove => 3,
    }
}

fn compile(criteria: &[u8]) -> Result<Regex> {
    let pattern = std::str::from_utf8(criteria)
        .map_err(|e| Error::InvalidFilterCriteria(format!("regex is not UTF-8: {}", e)))?;
    Regex::new(pattern).map_err(|e| Error::InvalidFilterCriteria(e.to_string()))
}

/// `_regex` key filter over keys of type `K`.
pub(crate) fn regex_key<K: Display + Send + Sync + 'static>() -> FilterConstructor {
    Arc::new(|criteria: &[u8]| {
        let regex = compile(criteria)?;
        Ok(Predicate::Key(Arc::new(move |key: &AnyValue| {
            key.downcast_ref::<K>()
                .is_some_and(|k| regex.is_match(&k.to_string()))
        })))
    })
}

/// `_event` sample filter.
pub(crate) fn event_sample() -> FilterConstructor {
    Arc::new(|criteria: &[u8]| {
        let mut events = Vec::with_capacity(criteria.len());
        for code in criteria {
            events.push(match code {
                0 => SampleEvent::Add,
                1 => SampleEvent::Update,
                2 => SampleEvent::PartialUpdate,
                3 => SampleEvent::Remove,
                other => {
                    return Err(Error::InvalidFilterCriteria(format!(
                        "unknown event code {}",
                        other
                    )))
                }
            });
        }
        Ok(Predicate::Sample(Arc::new(move |sample: &CoreSample| {
            events.contains(&sample.event)
        })))
    })
}

/// Sample filter factory matching the display string of sample values
/// against a regex. Register it with
/// [`Topic::set_sample_filter`](super::Topic::set_sample_filter):
///
/// ```rust,ignore
/// topic.set_sample_filter("_regex", filters::regex_sample());
/// ```
pub fn regex_sample<K, V, U>(
) -> impl Fn(&[u8]) -> Result<Box<dyn Fn(&Sample<K, V, U>) -> bool + Send + Sync>> + Send + Sync + 'static
where
    K: 'static,
    V: Display + 'static,
    U: 'static,
{
    |criteria: &[u8]| {
        let regex = compile(criteria)?;
        let predicate: Box<dyn Fn(&Sample<K, V, U>) -> bool + Send + Sync> =
            Box::new(move |sample: &Sample<K, V, U>| {
                sample
                    .value()
                    .is_some_and(|v| regex.is_match(&v.to_string()))
            });
        Ok(predicate)
    }
}
