pub mod compile_job;
pub mod instance;
pub mod job;
