//! Extended resource brokering (devices handed out by a node-local plugin).

use std::collections::BTreeMap;

use async_trait::async_trait;
use podex_id::PodId;
use podex_messages::ExtendedResourceRequest;

use super::error::ExecutorError;

/// What an allocator granted to a pod.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Allocation {
    /// Host device paths to map into every member.
    pub devices: Vec<String>,
    pub env: BTreeMap<String, String>,
}

#[async_trait]
pub trait ExtendedResourceAllocator: Send + Sync {
    async fn allocate(
        &self,
        pod_id: &PodId,
        requests: &[ExtendedResourceRequest],
    ) -> Result<Allocation, ExecutorError>;

    /// Returns everything granted to `pod_id`. Idempotent.
    async fn release(&self, pod_id: &PodId);
}

/// Grants nothing; any request fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAllocator;

#[async_trait]
impl ExtendedResourceAllocator for NoopAllocator {
    async fn allocate(
        &self,
        _pod_id: &PodId,
        requests: &[ExtendedResourceRequest],
    ) -> Result<Allocation, ExecutorError> {
        match requests.first() {
            None => Ok(Allocation::default()),
            Some(request) => Err(ExecutorError::Allocation(format!(
                "no allocator configured for {} x{}",
                request.name, request.count
            ))),
        }
    }

    async fn release(&self, _pod_id: &PodId) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_allocator() {
        let pod = PodId::new();
        let alloc = NoopAllocator.allocate(&pod, &[]).await.unwrap();
        assert_eq!(alloc, Allocation::default());

        let err = NoopAllocator
            .allocate(
                &pod,
                &[ExtendedResourceRequest {
                    name: "gpu".to_string(),
                    count: 2,
                }],
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("gpu x2"));
        NoopAllocator.release(&pod).await;
    }
}
