//! Incremental sync: what changed since a client's `pts` watermark.

pub mod difference;
pub mod routes;

use crate::repo::RepoError;

pub use difference::{ChannelDifference, Difference, DifferenceEngine};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("user is not a member of chat {0}")]
    NotMember(i64),
    #[error(transparent)]
    Repo(#[from] RepoError),
}
