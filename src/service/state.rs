//! Service state management.

use std::sync::Arc;
use std::time::Instant;

use crate::context::KernelContext;
use crate::types::{EntityFilter, Page};

/// Shared service state.
///
/// Cheap to clone; every handler sees the same kernel context.
#[derive(Clone)]
pub struct ServiceState {
    /// The kernel context (store, schema, runner, components).
    pub kernel: Arc<KernelContext>,
    started_at: Instant,
}

impl ServiceState {
    /// Wrap a started kernel.
    pub fn new(kernel: KernelContext) -> Self {
        Self::shared(Arc::new(kernel))
    }

    /// Wrap a kernel that is also held elsewhere (e.g. for shutdown).
    pub fn shared(kernel: Arc<KernelContext>) -> Self {
        Self {
            kernel,
            started_at: Instant::now(),
        }
    }

    /// Seconds since the state was created.
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Whether the store answers a minimal enumeration.
    pub async fn is_ready(&self) -> bool {
        match self
            .kernel
            .store()
            .get_all_entities(&EntityFilter::any(), Page::first(1))
            .await
        {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Readiness probe failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;

    #[tokio::test]
    async fn test_memory_kernel_is_ready() {
        let kernel = KernelContext::start(KernelConfig::default()).await.unwrap();
        let state = ServiceState::new(kernel);
        assert!(state.is_ready().await);
        assert_eq!(state.clone().uptime_secs(), 0);
    }
}
