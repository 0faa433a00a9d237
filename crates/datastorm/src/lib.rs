// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # DataStorm - Brokerless topic/key data distribution
//!
//! Peer nodes publish and subscribe to named topics partitioned by keys.
//! There is no broker: nodes discover each other by announcing topic names,
//! then open one publisher and one subscriber session per peer node over
//! which readers and writers of matching topics and keys are attached.
//!
//! ## Quick Start
//!
//! See [`api`] for a complete example.
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                          Typed API                                  |
//! |   Node -> Topic<K, V, U> -> Single/Multi/Filtered readers, writers  |
//! +---------------------------------------------------------------------+
//! |                           Engine                                    |
//! |   TopicCore | DataElement history | Sessions | Handshake | Retries  |
//! +---------------------------------------------------------------------+
//! |                          Discovery                                  |
//! |   Topic announcements | Node sessions | Relay forwarding            |
//! +---------------------------------------------------------------------+
//! |                          Transport                                  |
//! |   Transport trait | LocalNetwork (in-process)                       |
//! +---------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Node`] | Process identity, owns transport, sessions and callbacks |
//! | [`Topic`] | Named channel typed by key, value and update tag |
//! | [`SingleKeyWriter`] / [`MultiKeyWriter`] | Publish samples |
//! | [`SingleKeyReader`] / [`MultiKeyReader`] / [`FilteredKeyReader`] | Receive samples |
//! | [`RuntimeConfig`] | `DataStorm.*` properties |
//!
//! ## Modules Overview
//!
//! - [`api`] - Typed API (start here)
//! - [`config`] - Defaults, property names, runtime configuration
//! - [`protocol`] - Messages exchanged between nodes
//! - [`transport`] - Transport contract and the in-process transport

/// Typed API (Node, Topic, readers, writers, samples, filters).
pub mod api;
/// Defaults, property names and the runtime property store.
pub mod config;
/// Engine: topics, data elements, sessions, handshake.
mod core;
/// Topic announcements, node sessions and relay forwarding.
mod discovery;
/// Wire-level messages.
pub mod protocol;
/// Transport contract and in-process transport.
pub mod transport;

pub use api::{
    CallbackReason, ClearHistoryPolicy, Codec, CodecError, DiscardPolicy, Error, Executor,
    Filter, FilteredKeyReader, Key, MultiKeyReader, MultiKeyWriter, Node, NodeBuilder,
    ReaderConfig, Result, Sample, SampleEvent, SingleKeyReader, SingleKeyWriter, Task, Topic,
    WriterConfig,
};
#[cfg(feature = "serde")]
pub use api::Json;
pub use config::{RetryPolicy, RuntimeConfig};
pub use transport::local::LocalNetwork;
pub use transport::TransportError;
