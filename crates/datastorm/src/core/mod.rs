// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # Engine
//!
//! Untyped core shared by every typed topic of a node.
//!
//! | Module | Description |
//! |--------|-------------|
//! | `interner` | Deduplicating key, tag and filter factories |
//! | `sample` | Engine samples (encoded + lazily decoded value) |
//! | `element` | Data elements: listeners, history, callbacks |
//! | `topic` | Reader/writer topics and their subscription tables |
//! | `session` | Publisher/subscriber sessions with one peer node |
//! | `node` | Session handshake and session registry |
//! | `instance` | Per-node runtime owning all of the above |
//! | `barrier`, `executor`, `timer` | Concurrency primitives |
//!
//! ```text
//! +---------------------------------------------------------+
//! |  api: Topic / readers / writers (typed)                 |
//! +---------------------------------------------------------+
//! |  core: TopicCore -> DataElement -> History              |
//! |        Session (p/<peer>, s/<peer>)  NodeCore           |
//! +---------------------------------------------------------+
//! |  discovery: NodeSessionManager, Forwarder               |
//! +---------------------------------------------------------+
//! |  transport: Transport trait, LocalNetwork               |
//! +---------------------------------------------------------+
//! ```

pub(crate) mod barrier;
pub(crate) mod element;
pub(crate) mod executor;
pub(crate) mod instance;
pub(crate) mod interner;
pub(crate) mod node;
pub(crate) mod sample;
pub(crate) mod session;
pub(crate) mod timer;
pub(crate) mod topic;
