//! Docker gateway — per-host clients over the remote Docker API.
//!
//! Domain methods live in sibling modules (`container`, `image`, `network`,
//! `exec`, `archive`) which add `impl DockerClient` blocks.

mod archive;
mod client;
mod container;
mod exec;
mod image;
mod network;

pub use client::{DockerClient, DockerTls, DOCKER_API_TIMEOUT_SECS};
pub use container::ContainerSpec;
pub use exec::ExecOutput;
