//! Synchronization core of a multi-stream camera pipeline.
//!
//! Streams deliver buffers into channels, channels match buffers of the same
//! frame into bundles, and a device-wide state machine sequences preview,
//! capture and recording on top of them. Every layer runs its work on
//! dedicated command worker threads; see [`worker`].

pub mod capture;
pub mod channel;
pub mod config;
pub mod device;
pub mod error;
pub mod pipeline;
pub mod utils;
pub mod worker;

pub use config::Config;
pub use error::{Error, Result};
