// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Registry of the reader and writer topics of one node.

use super::{TopicCore, TopicShared};
use crate::api::{Error, Result};
use crate::core::element::ElementKind;
use crate::core::instance::Instance;
use crate::protocol::TopicInfo;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

#[derive(Default)]
struct Registry {
    readers: HashMap<String, Vec<Arc<TopicCore>>>,
    writers: HashMap<String, Vec<Arc<TopicCore>>>,
}

impl Registry {
    fn of(&self, kind: ElementKind) -> &HashMap<String, Vec<Arc<TopicCore>>> {
        match kind {
            ElementKind::Reader => &self.readers,
            ElementKind::Writer => &self.writers,
        }
    }

    fn of_mut(&mut self, kind: ElementKind) -> &mut HashMap<String, Vec<Arc<TopicCore>>> {
        match kind {
            ElementKind::Reader => &mut self.readers,
            ElementKind::Writer => &mut self.writers,
        }
    }
}

pub(crate) struct TopicFactory {
    instance: Weak<Instance>,
    registry: Mutex<Registry>,
}

impl TopicFactory {
    pub(crate) fn new(instance: Weak<Instance>) -> Self {
        Self {
            instance,
            registry: Mutex::new(Registry::default()),
        }
    }

    /// Register a new topic of `kind` and announce it to peers.
    pub(crate) fn create(&self, kind: ElementKind, shared: Arc<TopicShared>) -> Result<Arc<TopicCore>> {
        let instance = self.instance.upgrade().ok_or(Error::NodeShutdown)?;
        if instance.is_shutdown() {
            return Err(Error::NodeShutdown);
        }
        let topic = Arc::new(TopicCore::new(
            kind,
            shared,
            instance.name.clone(),
            instance.executor.clone(),
            instance.shutdown_flag(),
        ));
        let name = topic.name().to_string();
        let first = {
            let mut registry = self.registry.lock();
            let topics = registry.of_mut(kind).entry(name.clone()).or_default();
            topics.push(topic.clone());
            topics.len() == 1
        };
        log::debug!("[TOPIC] created {:?} topic {} ({})", kind, name, topic.id);

        instance.node.announce_topic(&topic);
        if first {
            instance.discovery.announce_topic(kind, &name);
        }
        Ok(topic)
    }

    /// Unregister and destroy `topic`.
    pub(crate) fn remove(&self, topic: &Arc<TopicCore>) {
        {
            let mut registry = self.registry.lock();
            let topics = registry.of_mut(topic.kind);
            if let Some(list) = topics.get_mut(&**topic.name()) {
                list.retain(|t| !Arc::ptr_eq(t, topic));
                if list.is_empty() {
                    topics.remove(&**topic.name());
                }
            }
        }
        for session in topic.destroy() {
            session.detach_local_topic(topic);
        }
    }

    pub(crate) fn topics(&self, kind: ElementKind, name: &str) -> Vec<Arc<TopicCore>> {
        self.registry
            .lock()
            .of(kind)
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn all(&self, kind: ElementKind) -> Vec<Arc<TopicCore>> {
        self.registry
            .lock()
            .of(kind)
            .values()
            .flatten()
            .cloned()
            .collect()
    }

    /// One info per topic name with the ids of every topic sharing it.
    pub(crate) fn infos(&self, kind: ElementKind) -> Vec<TopicInfo> {
        self.registry
            .lock()
            .of(kind)
            .iter()
            .map(|(name, topics)| TopicInfo {
                name: name.clone(),
                ids: topics.iter().map(|t| t.id).collect(),
            })
            .collect()
    }

    pub(crate) fn names(&self, kind: ElementKind) -> Vec<String> {
        self.registry.lock().of(kind).keys().cloned().collect()
    }

    pub(crate) fn has(&self, kind: ElementKind, name: &str) -> bool {
        self.registry.lock().of(kind).contains_key(name)
    }

    /// Wake the waiters of every topic.
    pub(crate) fn shutdown(&self) {
        for kind in [ElementKind::Reader, ElementKind::Writer] {
            for topic in self.all(kind) {
                topic.notify_shutdown();
            }
        }
    }
}
