use anyhow::Error;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Periodic background work (store housekeeping, metrics refresh) that
/// the ambient runtime drives and cancels through the token
#[async_trait]
pub trait Run: Send + Sync {
    async fn run(&self, token: CancellationToken) -> Result<(), Error>;
}
