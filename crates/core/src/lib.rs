//! Pure domain logic for the gamehost deployment daemon.
//!
//! Nothing in this crate performs I/O. Persistence lives in `gamehost-db`,
//! job execution in `gamehost-jobs` and the deployment pipeline in
//! `gamehost-deploy`.

pub mod error;
pub mod progress;
pub mod security;
pub mod source;
pub mod types;
