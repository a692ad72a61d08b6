//! Runtime configuration for the worker process
//!
//! Configuration is split into per-component sections with defaults matching
//! the platform's documented knobs, assembled either programmatically or from
//! the recognized environment variables (see [`env`]).

pub mod env;
pub mod types;

pub use types::{
    AudioConfig, CaptchaConfig, HumanInputConfig, MillConfig, PoolConfig, SchedulerConfig,
    StealthConfig,
};
