//! Kubernetes cluster lifecycle over SSH.
//!
//! Reconciles a declared [`Cluster`] against the last recorded one: the
//! first apply creates the cluster with kubeadm, later applies join or
//! remove hosts, and delete tears everything down.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use lifecycle::remote::ssh::{OpenSshExecutor, SshOptions};
//! use lifecycle::{Applier, BuildahImageService, Clusterfile, Environment, RuntimeConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let desired = Clusterfile::read("Clusterfile".as_ref())?;
//!     let executor = OpenSshExecutor::for_clusters(&[&desired.cluster], SshOptions::default())?;
//!     let env = Environment {
//!         config: RuntimeConfig::from_env(),
//!         executor: Arc::new(executor),
//!         images: Arc::new(BuildahImageService::default()),
//!     };
//!
//!     let mut applier = Applier::new(env, desired)?;
//!     applier.apply().await?;
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod applier;
pub mod checker;
pub mod config;
pub mod configs;
pub mod diff;
pub mod error;
pub mod fanout;
pub mod guest;
pub mod hosts;
pub mod image;
pub mod kubeadm;
pub mod prepare;
pub mod processor;
pub mod remote;
pub mod rootfs;
pub mod runtime;
pub mod scale_args;
pub mod store;
pub mod types;

#[doc(hidden)]
pub mod testing;

pub use applier::{Applier, Environment};
pub use config::RuntimeConfig;
pub use error::{ClusterError, Result};
pub use image::{BuildahImageService, ImageService};
pub use remote::RemoteExecutor;
pub use store::{ClusterStore, Clusterfile};
pub use types::Cluster;
