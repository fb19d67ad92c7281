//! Sidecar roles of the stand-in pod
//!
//! Two processes share this crate: `modal-proxy` runs the
//! connection-oriented outbound proxy and the authenticated HTTP gateway,
//! and `modal-logger` streams the remote app's log output to the pod's
//! stdout. Both load credentials exactly the way the operator does.

pub mod gateway;
pub mod logger;
pub mod socks;
