//! Modal backend client
//!
//! A narrow, typed façade over the app/function/endpoint primitives of the
//! Modal execution service. The operator only ever talks to the backend
//! through the [`ModalApi`] trait, so everything above this crate can be
//! driven against the deterministic [`MockClient`] in tests and in
//! mock-mode deployments.

#![deny(missing_docs)]

mod api;
mod client;
pub mod credentials;
pub mod errors;
mod mock;

pub use api::{
    AppState, AppStatus, DeployedApp, EndpointDeployed, EndpointRequest, FunctionDeployed,
    FunctionRequest, JobCreated, JobRequest, JobTask, LogStream, ModalApi,
};
pub use client::Client;
pub use credentials::{CredentialStore, TokenPair};
pub use errors::BackendError;
pub use mock::MockClient;
