pub mod config;
pub mod errors;
pub mod jobs;
pub mod logging;
pub mod stream;
pub mod sync;
