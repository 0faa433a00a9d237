// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-node runtime: owns every engine component of one node.
//!
//! ```text
//! Instance
//! +-- transport   (servants: node/<name>, DataStorm/Lookup, forward/*)
//! +-- executor    (listener callbacks)
//! +-- timer       (session and node-session retries)
//! +-- topics      (TopicFactory)
//! +-- node        (NodeCore: handshake + publisher/subscriber sessions)
//! +-- discovery   (NodeSessionManager + Forwarder)
//! ```
//!
//! Components hold a `Weak<Instance>` so the node handle owns the cycle.

use crate::api::Result;
use crate::config::{RuntimeConfig, NODE_CATEGORY};
use crate::core::executor::{CallbackExecutor, Executor};
use crate::core::node::{NodeCore, NodeServant};
use crate::core::timer::Timer;
use crate::core::topic::factory::TopicFactory;
use crate::discovery::NodeSessionManager;
use crate::protocol::NodeRef;
use crate::transport::{Identity, Transport};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub(crate) struct Instance {
    pub(crate) name: Arc<str>,
    pub(crate) config: RuntimeConfig,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) executor: Arc<CallbackExecutor>,
    pub(crate) timer: Timer,
    pub(crate) topics: TopicFactory,
    pub(crate) node: NodeCore,
    pub(crate) discovery: NodeSessionManager,
    shutdown: Arc<AtomicBool>,
    done: Mutex<bool>,
    done_cond: Condvar,
}

/// Options resolved by the node builder.
pub(crate) struct InstanceOptions {
    pub(crate) name: String,
    pub(crate) config: RuntimeConfig,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) executor: Option<Executor>,
    pub(crate) connect_to: Vec<String>,
    pub(crate) multicast: bool,
}

impl Instance {
    pub(crate) fn start(options: InstanceOptions) -> Result<Arc<Self>> {
        let executor = Arc::new(CallbackExecutor::new(&options.name, options.executor)?);
        let timer = Timer::new(&options.name)?;
        let name: Arc<str> = Arc::from(options.name.as_str());

        let instance = Arc::new_cyclic(|weak| Instance {
            name,
            config: options.config,
            transport: options.transport,
            executor,
            timer,
            topics: TopicFactory::new(weak.clone()),
            node: NodeCore::new(weak.clone()),
            discovery: NodeSessionManager::new(weak.clone()),
            shutdown: Arc::new(AtomicBool::new(false)),
            done: Mutex::new(false),
            done_cond: Condvar::new(),
        });

        instance.transport.register(
            instance.identity(),
            Arc::new(NodeServant {
                instance: Arc::downgrade(&instance),
            }),
        );
        if let Err(e) = instance
            .discovery
            .start(&options.connect_to, options.multicast)
        {
            instance.shutdown();
            return Err(e);
        }
        log::info!(
            "[NODE] {} started (endpoint={:?}, connect_to={:?}, multicast={})",
            instance.name,
            instance.transport.endpoint(),
            options.connect_to,
            options.multicast
        );
        Ok(instance)
    }

    pub(crate) fn identity(&self) -> Identity {
        Identity::new(NODE_CATEGORY, self.name.to_string())
    }

    pub(crate) fn node_ref(&self) -> NodeRef {
        NodeRef::new(self.name.to_string(), self.transport.endpoint())
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Stop the node. Blocked waits return `NodeShutdown`, sessions are
    /// destroyed and pending callbacks run before this returns.
    pub(crate) fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        log::debug!("[NODE] {} shutting down", self.name);
        self.topics.shutdown();
        self.discovery.shutdown();
        self.node.shutdown();
        self.timer.shutdown();
        self.transport.unregister(&self.identity());
        self.transport.shutdown();
        self.executor.shutdown();

        *self.done.lock() = true;
        self.done_cond.notify_all();
        log::info!("[NODE] {} shut down", self.name);
    }

    pub(crate) fn wait_for_shutdown(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.done_cond.wait(&mut done);
        }
    }
}
