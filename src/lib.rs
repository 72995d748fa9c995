//! Log in to managed Kubernetes installations and issue client certificates
//! for their workload clusters, keeping the local kubeconfig in sync.

pub mod api;
pub mod config;
pub mod crd;
pub mod error;
pub mod installation;
pub mod issuer;
pub mod kubeconfig;
pub mod login;
pub mod oidc;
pub mod resolver;
pub mod writer;

pub use error::{Error, ErrorKind, Result};
