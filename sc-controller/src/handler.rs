//! Handler capability invoked once per handler per reconcile round.

use std::future::Future;

use async_trait::async_trait;

use crate::patch::PatchOp;
use crate::resource::{Reason, ResourceKind, ResourceRef, ResourceSnapshot};

/// What a handler wants done with the resource.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    NoOp,
    /// Merge patch against the snapshot the handler was given.
    Patch(PatchOp),
}

impl From<PatchOp> for HandlerOutcome {
    fn from(patch: PatchOp) -> Self {
        if patch.is_empty() {
            HandlerOutcome::NoOp
        } else {
            HandlerOutcome::Patch(patch)
        }
    }
}

/// Per-invocation context handed to a handler.
#[derive(Debug, Clone)]
pub struct ReconcileContext {
    pub kind: ResourceKind,
    pub reference: ResourceRef,
    pub reason: Reason,
    /// Dispatcher-wide round number.
    pub round: u64,
    /// 1 for the first call in a round, incremented on each conflict retry.
    pub attempt: u32,
}

/// Trait for resource handlers.
///
/// Handlers never write to the store. They describe the change they want
/// and the dispatcher submits it through the patch applier. A handler may be
/// called more than once for the same state (duplicate notifications,
/// conflict retries), so the outcome must only depend on its inputs.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn reconcile(
        &self,
        ctx: &ReconcileContext,
        snapshot: &ResourceSnapshot,
    ) -> anyhow::Result<HandlerOutcome>;
}

/// Handler backed by an async closure. Built with [`handler_fn`].
pub struct FnHandler<F> {
    f: F,
}

/// Wrap `f` as a [`Handler`].
///
/// ```ignore
/// registry.register("annotate", handler_fn(|_ctx, snapshot| async move {
///     Ok(snapshot.mutate(|f| set_annotation(f, "k", "v")).into())
/// }));
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(ReconcileContext, ResourceSnapshot) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<HandlerOutcome>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(ReconcileContext, ResourceSnapshot) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<HandlerOutcome>> + Send + 'static,
{
    async fn reconcile(
        &self,
        ctx: &ReconcileContext,
        snapshot: &ResourceSnapshot,
    ) -> anyhow::Result<HandlerOutcome> {
        (self.f)(ctx.clone(), snapshot.clone()).await
    }
}
