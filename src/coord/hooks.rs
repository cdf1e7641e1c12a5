//! Policy hooks invoked around coordinator operations.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;

use crate::utils::StrataError;

/// Operation a hook fires for.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum HookEvent {
    Open,
    Create,
    Put,
    Get,
    Replicate,
    Portal,
}

/// Key-value context handed to hooks (logical path, resource, ...).
pub type HookContext = BTreeMap<String, String>;

/// Rule engine seam. A pre-hook error aborts the operation before any lock
/// or RST mutation; post-hooks only observe.
#[async_trait]
pub trait PolicyHooks: fmt::Debug + Send + Sync {
    async fn pre(
        &self,
        _event: HookEvent,
        _ctx: &HookContext,
    ) -> Result<(), StrataError> {
        Ok(())
    }

    async fn post(
        &self,
        _event: HookEvent,
        _ctx: &HookContext,
        _status: Result<(), &StrataError>,
    ) {
    }
}

/// Hooks that accept everything.
#[derive(Debug, Default)]
pub struct NoopHooks;

#[async_trait]
impl PolicyHooks for NoopHooks {}
