//! Reconcile dispatch for a StorageClass controller.
//!
//! A watched resource change becomes a [`ReconcileRequest`]. The
//! [`ReconcileDispatcher`] runs every handler in the [`HandlerRegistry`]
//! against one shared snapshot, submits the resulting merge patches through
//! the [`PatchApplier`] under optimistic concurrency, and reports per-handler
//! outcomes. [`ConvergencePoller`] lets callers wait for the written state to
//! become visible.

pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod patch;
pub mod poller;
pub mod queue;
pub mod registry;
pub mod resource;
pub mod storage_class;
pub mod store;

pub use config::{Backoff, ControllerConfig};
pub use controller::{Controller, ControllerHandle};
pub use dispatcher::{HandlerReport, HandlerResult, ReconcileDispatcher, RoundReport};
pub use error::{Error, Result};
pub use handler::{handler_fn, Handler, HandlerOutcome, ReconcileContext};
pub use patch::{PatchApplier, PatchOp};
pub use poller::{wait_until, ConvergencePoller};
pub use queue::WorkQueue;
pub use registry::{HandlerName, HandlerRegistry};
pub use resource::{
    set_annotation, set_label, Reason, ReconcileRequest, ResourceKind, ResourceRef,
    ResourceSnapshot, Version,
};
pub use storage_class::{StorageClass, IS_DEFAULT_CLASS_ANNOTATION};
pub use store::{LabelSelector, MemoryStore, ResourceStore, StoreError, WatchEvent};
