//! browsermill: distributed browser-automation job platform.
//!
//! Clients submit URL+action pipelines; worker processes claim them from a
//! persistent queue, execute them through pooled stealth-hardened headless
//! browsers, solve anti-bot challenges along the way, and return structured
//! artifacts. The pipeline per job is:
//! queue → dispatch → browser acquire → context create+stealth → action
//! execution → (optional) captcha detect+solve → artifact capture →
//! context teardown → browser release.

pub mod browser;
pub mod captcha;
pub mod config;
pub mod context;
pub mod correlation;
pub mod error;
pub mod events;
pub mod processor;
pub mod scheduler;

pub use browser::{BrowserPool, PoolStats, PooledBrowserGuard};
pub use captcha::{
    AntiBotSystem, AudioPipeline, CaptchaChallenge, CaptchaSolution, ChallengeType,
    DetectionRegistry, SolverOrchestrator, SolverRegistry, WidgetInteractor,
    build_default_registry,
};
pub use config::MillConfig;
pub use context::{ContextOptions, JobContext};
pub use correlation::{ErrorAggregator, ErrorContext, run_in_scope};
pub use error::{AutomationError, AutomationResult, ErrorCategory};
pub use events::{JobEvent, JobEventBus};
pub use processor::{ActionHandler, ActionRegistry, JobProcessor};
pub use scheduler::{
    Action, AutomationJob, BrowserFamily, BrowserStorage, JobSpec, JobStatus, JobStore, Scheduler,
};
