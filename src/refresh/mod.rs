//! Refresh invocation
//!
//! The consumer does not know what a stats refresh computes; it hands one
//! user id at a time to an external batch processor and only observes
//! success or failure.

mod command;

pub use command::{CommandInvoker, USER_ID_PLACEHOLDER};

use crate::error::RefreshFailure;

/// Runs a stats refresh for exactly one user
///
/// Implementations carry no retry logic; retrying is the retry policy's job.
#[async_trait::async_trait]
pub trait RefreshInvoker: Send + Sync {
    async fn refresh(&self, user_id: u64) -> Result<(), RefreshFailure>;
}

#[async_trait::async_trait]
impl<T: RefreshInvoker + ?Sized> RefreshInvoker for std::sync::Arc<T> {
    async fn refresh(&self, user_id: u64) -> Result<(), RefreshFailure> {
        (**self).refresh(user_id).await
    }
}

// Re-export async_trait for invoker implementations
pub use async_trait::async_trait;
