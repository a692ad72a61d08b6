//! Captcha handling: detection, widget interaction, audio transcription,
//! and solver orchestration.

pub mod audio;
pub mod detection;
pub mod solver;
pub mod types;
pub mod widget;

pub use audio::{AudioPipeline, TranscriptionCache, TranscriptionProvider};
pub use detection::{Detection, DetectionRegistry, PageSnapshot};
pub use solver::{SolverOrchestrator, SolverRegistry, build_default_registry, default_challenge_type};
pub use types::{AntiBotSystem, CaptchaChallenge, CaptchaSolution, ChallengeType, SolutionKind};
pub use widget::{InteractionOutcome, LocatorOptions, LocatorStrategy, WidgetInteractor};
