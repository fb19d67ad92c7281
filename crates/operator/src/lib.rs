//! modal-operator control plane
//!
//! Intercepts GPU workloads at admission, replaces their runtime with a
//! lightweight stand-in pod, and drives the real execution on the Modal
//! backend: an admission mutator, reconcilers for the three custom
//! resources, a pod interception path, and a status synchronizer that
//! projects remote state back onto the stand-in.

pub mod annotations;
pub mod capsule;
pub mod classify;
pub mod config;
pub mod controllers;
pub mod crd;
pub mod metrics;
mod operator;
pub mod podwatch;
pub mod status_sync;
pub mod trainjob;
pub mod translate;
pub mod webhook;

pub use config::Config;
pub use operator::{shutdown_signal, Operator};
