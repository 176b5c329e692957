//! Build pipeline for a game server instance.
//!
//! - [`registry`]: reference-counted build artifacts on disk, the "latest
//!   build" notifier and the serial deletion worker.
//! - [`compiler`]: one end-to-end compile (copy, compile, probe, stage).
//! - [`deployment`]: the scheduler job that drives a compile.
//! - Collaborator seams ([`hooks`], [`augment`], [`notify`], [`repository`],
//!   [`engine`], [`probe`]) with local default implementations.

pub mod artifact;
pub mod augment;
pub mod compiler;
pub mod deployment;
pub mod engine;
pub mod error;
pub mod fs;
pub mod hooks;
pub mod notify;
pub mod probe;
pub mod process;
pub mod registry;
pub mod repository;

pub use artifact::BuildArtifact;
pub use compiler::{CompileCollaborators, CompileOrchestrator, CompileRequest, CompileSettings};
pub use deployment::{DeploymentManager, DeploymentRuntime};
pub use error::RegistryError;
pub use registry::{ArtifactHandle, BuildArtifactRegistry, DirectoryReservation};
