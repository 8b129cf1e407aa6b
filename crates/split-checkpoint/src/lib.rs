pub mod archive;
pub mod checkpoint;
pub mod codec;
pub mod config;
pub mod error;
pub mod log_sanitize;
pub mod logging;
pub mod manifest;
pub mod process;
pub mod store;
pub mod volume;

pub use checkpoint::Checkpointer;
pub use error::{Error, ErrorKind, Result};
