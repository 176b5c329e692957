//! Repository layer.
//!
//! Each repository is a zero-sized struct providing async methods that
//! accept `&PgPool` as the first argument.

pub mod compile_job_repo;
pub mod instance_repo;
pub mod job_repo;

pub use compile_job_repo::CompileJobRepo;
pub use instance_repo::InstanceRepo;
pub use job_repo::JobRepo;
