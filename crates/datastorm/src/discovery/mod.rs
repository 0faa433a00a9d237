// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Node discovery.
//!
//! Nodes find each other through topic name announcements sent to the
//! well-known lookup servant `DataStorm/Lookup`:
//!
//! - over multicast when enabled,
//! - over node sessions established with configured peers (`connect_to`).
//!
//! A node accepting node sessions also relays: it forwards announcements
//! between its peers and forwards session traffic to peers that cannot be
//! dialed directly (see [`forwarder`]).
//!
//! ```text
//!   client A ----(node session)----> server S <----(node session)---- client B
//!      AnnounceTopicWriter("t") --->  forward ---> AnnounceTopicWriter("t", relay=S)
//!                                                       B: create_subscriber_session(A via S)
//! ```

pub(crate) mod forwarder;
pub(crate) mod manager;

pub(crate) use forwarder::Forwarder;
pub(crate) use manager::NodeSessionManager;
