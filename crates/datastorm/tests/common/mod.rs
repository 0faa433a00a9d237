// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared helpers for the integration tests.

#![allow(dead_code)]

use datastorm::config::props;
use datastorm::{LocalNetwork, Node, RuntimeConfig};
use std::thread;
use std::time::{Duration, Instant};

/// Upper bound for anything the tests wait on.
pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Config with a short reconnection delay.
pub fn fast_config() -> RuntimeConfig {
    let config = RuntimeConfig::new();
    config.set(props::NODE_RETRY_DELAY, "20");
    config.set(props::NODE_RETRY_MULTIPLIER, "1");
    config
}

/// Node reachable at `endpoint`.
pub fn server(network: &LocalNetwork, name: &str, endpoint: &str) -> Node {
    Node::builder(name)
        .network(network)
        .endpoint(endpoint)
        .config(fast_config())
        .build()
        .expect("server node")
}

/// Node without an endpoint connecting to `peer`.
pub fn client(network: &LocalNetwork, name: &str, peer: &str) -> Node {
    Node::builder(name)
        .network(network)
        .connect_to(peer)
        .config(fast_config())
        .build()
        .expect("client node")
}

/// Poll `cond` until it holds, panicking after [`TIMEOUT`].
pub fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(5));
    }
}
