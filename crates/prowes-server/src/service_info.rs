use prowes_contract::ServiceInfo;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Process-wide service info record, shared through [`crate::service::AppState`].
#[derive(Clone, Default)]
pub struct ServiceInfoRegistry {
    inner: Arc<RwLock<ServiceInfo>>,
}

impl ServiceInfoRegistry {
    pub fn new(info: ServiceInfo) -> Self {
        Self {
            inner: Arc::new(RwLock::new(info)),
        }
    }

    pub async fn get(&self) -> ServiceInfo {
        self.inner.read().await.clone()
    }

    /// Replace the record. Derived counters are never stored.
    pub async fn set(&self, mut info: ServiceInfo) {
        info.system_state_counts.clear();
        *self.inner.write().await = info;
    }

    pub async fn supports(&self, workflow_type: &str, version: &str) -> bool {
        self.inner.read().await.supports(workflow_type, version)
    }
}
