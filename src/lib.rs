pub mod chain;
pub mod config;
pub mod error;
pub mod lightning;
pub mod logging;
pub mod service;
pub mod swap;

pub use config::EngineConfig;
pub use error::{ErrorKind, SwapError};
pub use swap::engine::{SwapEngine, SwapInHandle, SwapInRequest, SwapOutRequest};
pub use swap::{SwapDirection, SwapEvent, SwapStatus, SwapSummary};
