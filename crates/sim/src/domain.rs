// Domain - an isolated namespace of simulated queues

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use courier_core::domain::{Binding, ConnectionId};
use tracing::debug;

use crate::queue::SimQueue;

/// Queues keyed by `source^filter^worker`
pub struct Domain {
    name: String,
    queues: Mutex<BTreeMap<String, Arc<SimQueue>>>,
}

impl Domain {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queues: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Arc<SimQueue>>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Find or create the queue for `binding` under `worker`
    pub fn ensure_queue(
        &self,
        binding: Binding,
        worker: String,
        owner: Option<ConnectionId>,
    ) -> Arc<SimQueue> {
        let id = binding.queue_id(&worker);
        let mut queues = self.lock();
        queues
            .entry(id)
            .or_insert_with_key(|id| {
                debug!(domain = %self.name, queue = %id, "Queue created");
                SimQueue::spawn(binding, worker, owner)
            })
            .clone()
    }

    /// Queues a publish on `source` with `tag` is routed to
    pub fn queues_binding(&self, source: &str, tag: &str) -> Vec<Arc<SimQueue>> {
        self.lock()
            .values()
            .filter(|q| q.binds(source, tag))
            .cloned()
            .collect()
    }

    pub fn find(&self, queue_id: &str) -> Option<Arc<SimQueue>> {
        self.lock().get(queue_id).cloned()
    }

    pub fn find_worker(&self, worker: &str) -> Option<Arc<SimQueue>> {
        self.lock().values().find(|q| q.worker() == worker).cloned()
    }

    pub fn has_source(&self, source: &str) -> bool {
        self.lock().values().any(|q| q.binding().source == source)
    }

    pub fn has_worker(&self, worker: &str) -> bool {
        self.lock().values().any(|q| q.worker() == worker)
    }

    /// Delete matching queues; returns how many went away
    pub fn remove_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&SimQueue) -> bool,
    {
        let removed: Vec<Arc<SimQueue>> = {
            let mut queues = self.lock();
            let ids: Vec<String> = queues
                .iter()
                .filter(|(_, q)| predicate(q))
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| queues.remove(id)).collect()
        };
        for queue in &removed {
            queue.shutdown();
            debug!(domain = %self.name, queue = %queue.id(), "Queue deleted");
        }
        removed.len()
    }

    /// Forget a closed connection
    ///
    /// Its subscribers leave every queue, unacked work goes back to the
    /// pending pool, and its exclusive listener queues are deleted.
    pub fn detach_connection(&self, connection: &str) {
        let queues: Vec<Arc<SimQueue>> = self.lock().values().cloned().collect();
        for queue in queues {
            queue.detach(connection);
        }
        self.remove_where(|q| q.owner() == Some(connection));
    }

    pub fn queue_ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_worker_queues_are_shared_listener_queues_are_not() {
        let domain = Domain::new("test");
        let a = domain.ensure_queue(
            Binding::new("X", None, Some("w".to_string())),
            "w".to_string(),
            None,
        );
        let b = domain.ensure_queue(
            Binding::new("X", None, Some("w".to_string())),
            "w".to_string(),
            None,
        );
        assert!(Arc::ptr_eq(&a, &b));

        domain.ensure_queue(Binding::new("X", None, None), "l1".to_string(), Some("c1".into()));
        domain.ensure_queue(Binding::new("X", None, None), "l2".to_string(), Some("c1".into()));
        assert_eq!(domain.queues_binding("X", "any.tag").len(), 3);
        assert!(domain.has_source("X"));
        assert!(domain.has_worker("w"));
    }

    #[tokio::test]
    async fn test_detach_drops_exclusive_queues() {
        let domain = Domain::new("test");
        domain.ensure_queue(Binding::new("X", None, None), "l1".to_string(), Some("c1".into()));
        domain.ensure_queue(Binding::new("X", None, None), "l2".to_string(), Some("c2".into()));
        domain.detach_connection("c1");
        assert_eq!(domain.queue_ids(), vec!["X^#^l2".to_string()]);
    }

    #[tokio::test]
    async fn test_remove_where_shuts_queues_down() {
        let domain = Domain::new("test");
        let queue = domain.ensure_queue(
            Binding::new("X", Some("a.*"), Some("w".to_string())),
            "w".to_string(),
            None,
        );
        assert_eq!(domain.remove_where(|q| q.binding().source == "X"), 1);
        assert!(queue.is_closed());
        assert!(!domain.has_source("X"));
        assert!(domain.find("X^a.*^w").is_none());
    }
}
