pub mod observability;
pub mod server;

pub use observability::{apply_logging_level, init_tracing, init_tracing_with_level, shutdown_tracing};
pub use server::{ServerBuilder, VaultServer};
