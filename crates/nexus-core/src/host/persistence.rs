//! Checkpoint persistence seam.
//!
//! The core decides *when* to checkpoint (wave boundaries, escalations);
//! where the bytes go is the host's business. Writes are serialized by
//! the coordinator.

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::checkpoint::Checkpoint;

#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn write_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()>;

    async fn read_checkpoint(&self, id: Uuid) -> Result<Option<Checkpoint>>;

    /// Ids of all stored checkpoints, oldest first.
    async fn list_checkpoints(&self) -> Result<Vec<Uuid>>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn PersistenceGateway) {}
};
