//! Application pause/resume hook

use async_trait::async_trait;

use crate::error::Result;

/// Something that can stop and restart its database traffic.
///
/// During a switchover every node pauses before the final sync and resumes
/// once the cluster is done (or aborted).
#[async_trait]
pub trait PauseResumer: Send + Sync {
    /// Stop issuing new database work and drop idle connections.
    async fn pause(&self) -> Result<()>;

    /// Allow database work again.
    async fn resume(&self) -> Result<()>;
}
