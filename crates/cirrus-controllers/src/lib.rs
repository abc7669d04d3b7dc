//! Cirrus Controllers - Reconcilers for vSphere-backed clusters
//!
//! Each reconciler drives one kind toward its desired state using the object
//! store and the platform services in [`Context`]. A [`Controller`] runs one
//! reconciler off a work queue; the [`Manager`] runs all of them.

// Allow unused assignments for diagnostic fields - they're used by the thiserror/miette macros
#![allow(unused_assignments)]

pub mod cluster;
pub mod cluster_modules;
pub mod config;
pub mod context;
pub mod deployment_zone;
pub mod error;
pub mod identity;
pub mod ipam;
pub mod manager;
pub mod patch;
pub mod poller;
pub mod queue;
pub mod reconciler;
pub mod runner;
pub mod vm;

#[cfg(test)]
mod testutil;

pub use config::ControllerConfig;
pub use context::Context;
pub use error::{ReconcileError, Result};
pub use manager::Manager;
pub use reconciler::{Action, Reconciler};
pub use runner::Controller;

// Re-export reconcilers and their building blocks
pub use cluster::ClusterReconciler;
pub use cluster_modules::ClusterModuleReconciler;
pub use deployment_zone::ZoneReconciler;
pub use identity::{IdentityReconciler, StoreCredentialsProvider};
pub use patch::PatchHelper;
pub use poller::{PollerGuard, PollerRegistry};
pub use queue::{Completion, WorkQueue};
pub use vm::VmReconciler;
