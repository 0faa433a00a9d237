// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # DataStorm Typed API
//!
//! Typed front-end over the untyped protocol engine.
//!
//! ## Overview
//!
//! - **Node**: one process's identity, owns the transport and every session
//! - **Topic**: named channel typed by key `K`, value `V` and update tag `U`
//! - **Writers**: publish samples for one key, a key set, or any key
//! - **Readers**: receive samples for one key, a key set, any key, or a key filter
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use datastorm::{LocalNetwork, Node, Topic, SingleKeyWriter, SingleKeyReader, ReaderConfig};
//!
//! let network = LocalNetwork::new();
//! let publisher = Node::builder("publisher")
//!     .transport(network.adapter(Some("pub"))?)
//!     .build()?;
//! let subscriber = Node::builder("subscriber")
//!     .transport(network.adapter(None)?)
//!     .connect_to("pub")
//!     .build()?;
//!
//! let prices = Topic::<String, f64>::new(&publisher, "prices")?;
//! let writer = SingleKeyWriter::new(&prices, "AAPL".to_string())?;
//!
//! let quotes = Topic::<String, f64>::new(&subscriber, "prices")?;
//! let reader = SingleKeyReader::new(&quotes, "AAPL".to_string(), ReaderConfig::default())?;
//!
//! writer.wait_for_readers(1)?;
//! writer.add(187.5)?;
//! let sample = reader.next_unread()?;
//! println!("{} = {:?}", sample.key(), sample.value());
//! # Ok::<(), datastorm::Error>(())
//! ```
//!
//! ## Entity Hierarchy
//!
//! ```text
//! Node
//! +-- Topic<K, V, U>
//!     +-- SingleKeyWriter / MultiKeyWriter
//!     +-- SingleKeyReader / MultiKeyReader / FilteredKeyReader
//! ```

pub mod codec;
pub mod filters;
mod node;
mod reader;
mod sample;
mod topic;
mod writer;

pub use codec::{Codec, CodecError};
#[cfg(feature = "serde")]
pub use codec::Json;
pub use node::{Node, NodeBuilder};
pub use reader::{FilteredKeyReader, MultiKeyReader, ReaderConfig, SingleKeyReader};
pub use filters::Filter;
pub use sample::Sample;
pub use topic::{Key, Topic};
pub use writer::{MultiKeyWriter, SingleKeyWriter, WriterConfig};

pub use crate::core::executor::{Executor, Task};
pub use crate::protocol::{ClearHistoryPolicy, DiscardPolicy, SampleEvent};

use crate::transport::TransportError;

/// Connection state change reported to connected-keys/elements callbacks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CallbackReason {
    Connect,
    Disconnect,
}

/// Errors returned by DataStorm operations.
///
/// Distributed-protocol anomalies (stale sessions, lost handshake races,
/// malformed remote announcements) never surface here: they are handled by
/// the engine and only traced.
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Lifecycle Errors
    // ========================================================================
    /// The node is shutting down; blocking waits return this immediately.
    NodeShutdown,
    /// The topic or element was destroyed.
    Destroyed,

    // ========================================================================
    // Usage Errors
    // ========================================================================
    /// Invalid argument supplied by the application.
    InvalidArgument(String),
    /// No filter factory registered under this name.
    UnknownFilter(String),
    /// Filter criteria could not be decoded or compiled.
    InvalidFilterCriteria(String),
    /// No partial update function registered for this tag.
    UnknownUpdater(String),

    // ========================================================================
    // Data Errors
    // ========================================================================
    /// Value, key or tag could not be decoded.
    Decode(CodecError),

    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Invalid property value.
    Config(String),
    /// Property file not found at the specified path.
    ConfigFileNotFound(String),
    /// I/O error with underlying cause.
    Io(std::io::Error),

    // ========================================================================
    // Transport Errors
    // ========================================================================
    Transport(TransportError),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            // Lifecycle
            Error::NodeShutdown => write!(f, "Node is shutting down"),
            Error::Destroyed => write!(f, "Object destroyed"),
            // Usage
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Error::UnknownFilter(name) => write!(f, "Unknown filter: {}", name),
            Error::InvalidFilterCriteria(msg) => write!(f, "Invalid filter criteria: {}", msg),
            Error::UnknownUpdater(tag) => write!(f, "No updater registered for tag {}", tag),
            // Data
            Error::Decode(e) => write!(f, "Decode failed: {}", e),
            // Configuration
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::ConfigFileNotFound(path) => write!(f, "Config file not found: {}", path),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            // Transport
            Error::Transport(e) => write!(f, "Transport error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Decode(e) => Some(e),
            Error::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CodecError> for Error {
    fn from(e: CodecError) -> Self {
        Error::Decode(e)
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Error::Transport(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

/// Convenient alias for API results using the public `Error` type.
pub type Result<T> = std::result::Result<T, Error>;
