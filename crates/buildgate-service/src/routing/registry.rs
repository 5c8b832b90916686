use std::sync::Arc;

use reqwest::Client;

use crate::config::BackendConfig;
use crate::{GatewayError, InstanceName};

use super::{BuildQueue, BuildQueueGetter, HttpBuildQueue};

/// Backends keyed by instance name prefix.
///
/// An instance name is served by the backend with the longest prefix matching it component by
/// component, so a backend for `mobile` serves `mobile/ios` unless a backend for `mobile/ios`
/// exists.
pub struct BackendRegistry {
    /// Ordered by decreasing number of prefix components.
    backends: Vec<(InstanceName, Arc<dyn BuildQueue>)>,
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let prefixes: Vec<_> = self.backends.iter().map(|(prefix, _)| prefix).collect();
        f.debug_struct("BackendRegistry")
            .field("prefixes", &prefixes)
            .finish()
    }
}

impl BackendRegistry {
    pub fn new(backends: impl IntoIterator<Item = (InstanceName, Arc<dyn BuildQueue>)>) -> Self {
        let mut backends: Vec<_> = backends.into_iter().collect();
        backends.sort_by_key(|(prefix, _)| std::cmp::Reverse(prefix.components().count()));
        Self { backends }
    }

    /// Creates a registry of [`HttpBuildQueue`]s from the configured backends.
    pub fn from_config(client: &Client, backends: &[BackendConfig]) -> Self {
        Self::new(backends.iter().map(|backend| {
            tracing::info!(
                prefix = backend.instance_name_prefix.as_str(),
                url = %backend.url,
                "registered backend"
            );
            let queue: Arc<dyn BuildQueue> =
                Arc::new(HttpBuildQueue::new(client.clone(), &backend.url));
            (backend.instance_name_prefix.clone(), queue)
        }))
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

impl BuildQueueGetter for BackendRegistry {
    fn get(&self, instance_name: &InstanceName) -> Result<Arc<dyn BuildQueue>, GatewayError> {
        self.backends
            .iter()
            .find(|(prefix, _)| instance_name.has_prefix(prefix))
            .map(|(_, queue)| Arc::clone(queue))
            .ok_or_else(|| GatewayError::NotFound("No backend configured".into()))
    }
}
