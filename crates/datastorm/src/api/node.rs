// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Node handle and builder.

use super::{Error, Result};
use crate::config::{props, RuntimeConfig};
use crate::core::executor::{Executor, Task};
use crate::core::instance::{Instance, InstanceOptions};
use crate::transport::local::LocalNetwork;
use crate::transport::Transport;
use std::sync::Arc;

/// One process's pub-sub identity.
///
/// Dropping the node shuts it down: sessions are destroyed, blocked waits
/// return [`Error::NodeShutdown`] and pending callbacks are run.
pub struct Node {
    pub(crate) instance: Arc<Instance>,
}

impl Node {
    pub fn builder(name: impl Into<String>) -> NodeBuilder {
        NodeBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.instance.name
    }

    /// Endpoint peers can dial, if any.
    pub fn endpoint(&self) -> Option<String> {
        self.instance.transport.endpoint()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.instance.config
    }

    pub fn shutdown(&self) {
        self.instance.shutdown();
    }

    pub fn is_shutdown(&self) -> bool {
        self.instance.is_shutdown()
    }

    /// Block until another thread shuts the node down.
    pub fn wait_for_shutdown(&self) {
        self.instance.wait_for_shutdown();
    }

    /// Block until every callback queued so far has run.
    pub fn flush(&self) {
        self.instance.executor.flush();
    }

    /// Number of peer nodes this node has a discovery session with.
    pub fn peer_count(&self) -> usize {
        self.instance.discovery.session_count()
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.instance.shutdown();
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.instance.name)
            .field("endpoint", &self.endpoint())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

/// Builder for [`Node`].
///
/// Properties of the [`RuntimeConfig`] fill what the builder leaves unset:
/// `DataStorm.Node.Name`, `DataStorm.Node.Server.Endpoint`,
/// `DataStorm.Node.ConnectTo` (comma separated) and
/// `DataStorm.Node.Multicast.Enabled`.
pub struct NodeBuilder {
    name: String,
    endpoint: Option<String>,
    connect_to: Vec<String>,
    multicast: Option<bool>,
    config: RuntimeConfig,
    executor: Option<Executor>,
    transport: Option<Arc<dyn Transport>>,
    network: Option<LocalNetwork>,
}

impl NodeBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: None,
            connect_to: Vec::new(),
            multicast: None,
            config: RuntimeConfig::new(),
            executor: None,
            transport: None,
            network: None,
        }
    }

    /// Endpoint of the adapter created on the [`network`](Self::network).
    #[must_use]
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Peer to open a discovery session with; can be repeated.
    #[must_use]
    pub fn connect_to(mut self, endpoint: impl Into<String>) -> Self {
        self.connect_to.push(endpoint.into());
        self
    }

    #[must_use]
    pub fn multicast(mut self, enabled: bool) -> Self {
        self.multicast = Some(enabled);
        self
    }

    #[must_use]
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Run listener callbacks through `executor` instead of the node's
    /// callback thread.
    #[must_use]
    pub fn executor(mut self, executor: impl Fn(Task) + Send + Sync + 'static) -> Self {
        self.executor = Some(Arc::new(executor));
        self
    }

    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Create the node's adapter on an in-process network.
    #[must_use]
    pub fn network(mut self, network: &LocalNetwork) -> Self {
        self.network = Some(network.clone());
        self
    }

    pub fn build(self) -> Result<Node> {
        let config = self.config;
        let name = if self.name.is_empty() {
            config
                .get(props::NODE_NAME)
                .map(|n| n.to_string())
                .ok_or_else(|| Error::InvalidArgument("node name is empty".into()))?
        } else {
            self.name
        };

        let transport: Arc<dyn Transport> = match (self.transport, self.network) {
            (Some(transport), _) => transport,
            (None, Some(network)) => {
                let endpoint = self
                    .endpoint
                    .or_else(|| config.get(props::NODE_SERVER_ENDPOINT).map(|e| e.to_string()));
                network.adapter(endpoint.as_deref())?
            }
            (None, None) => {
                return Err(Error::InvalidArgument(
                    "node needs a transport or a network".into(),
                ))
            }
        };

        let mut connect_to = self.connect_to;
        if let Some(peers) = config.get(props::NODE_CONNECT_TO) {
            connect_to.extend(
                peers
                    .split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string),
            );
        }
        let multicast = match self.multicast {
            Some(enabled) => enabled,
            None => config.get_bool(props::NODE_MULTICAST_ENABLED)?.unwrap_or(false),
        };

        let instance = Instance::start(InstanceOptions {
            name,
            config,
            transport,
            executor: self.executor,
            connect_to,
            multicast,
        })?;
        Ok(Node { instance })
    }
}
