// Domain registry

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::domain::Domain;

/// Domain used when the caller does not name one
pub const DEFAULT_DOMAIN: &str = "default";

/// Named domains, created on first use
///
/// Cloning shares the registry; independent registries never see each
/// other's queues.
#[derive(Clone, Default)]
pub struct DomainRegistry {
    domains: Arc<Mutex<HashMap<String, Arc<Domain>>>>,
}

impl DomainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn domain(&self, name: &str) -> Arc<Domain> {
        let mut domains = self.domains.lock().unwrap_or_else(PoisonError::into_inner);
        domains
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Domain::new(name)))
            .clone()
    }
}
