//! Ekko controller: keeps every `Echo` paired with a running child pod.
//!
//! Parent changes enqueue the parent key; child changes are routed to the
//! controlling parent. Workers pull keys and run the [`Reconciler`].

#![forbid(unsafe_code)]

pub mod config;
pub mod reconciler;
pub mod router;
mod runner;

pub use config::{ControllerConfig, DEFAULT_CHILD_IMAGE};
pub use reconciler::{build_child, child_name, Action, Reconcile, ReconcileError, Reconciler};
pub use router::{EnqueueParent, OwnershipRouter};
pub use runner::{process_item, Controller, QUEUE_NAME};
