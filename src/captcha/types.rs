//! Challenge taxonomy shared by detection, widgets, and solvers.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Anti-bot vendor families the platform recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AntiBotSystem {
    Recaptcha,
    Hcaptcha,
    Turnstile,
    Datadome,
    Akamai,
    Funcaptcha,
}

impl fmt::Display for AntiBotSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Recaptcha => "recaptcha",
            Self::Hcaptcha => "hcaptcha",
            Self::Turnstile => "turnstile",
            Self::Datadome => "datadome",
            Self::Akamai => "akamai",
            Self::Funcaptcha => "funcaptcha",
        };
        f.write_str(name)
    }
}

/// The concrete challenge a page is presenting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChallengeType {
    RecaptchaV2Checkbox,
    RecaptchaV2Invisible,
    RecaptchaV2Audio,
    RecaptchaV2Image,
    RecaptchaV3,
    HcaptchaCheckbox,
    HcaptchaInvisible,
    HcaptchaAudio,
    HcaptchaAccessibility,
    Turnstile,
    DatadomeSensor,
    DatadomeCaptcha,
    DatadomeSlider,
    AkamaiLevel1,
    AkamaiLevel2,
    AkamaiLevel3,
    Funcaptcha,
}

impl ChallengeType {
    /// The vendor family this challenge belongs to.
    #[must_use]
    pub fn system(self) -> AntiBotSystem {
        match self {
            Self::RecaptchaV2Checkbox
            | Self::RecaptchaV2Invisible
            | Self::RecaptchaV2Audio
            | Self::RecaptchaV2Image
            | Self::RecaptchaV3 => AntiBotSystem::Recaptcha,
            Self::HcaptchaCheckbox
            | Self::HcaptchaInvisible
            | Self::HcaptchaAudio
            | Self::HcaptchaAccessibility => AntiBotSystem::Hcaptcha,
            Self::Turnstile => AntiBotSystem::Turnstile,
            Self::DatadomeSensor | Self::DatadomeCaptcha | Self::DatadomeSlider => {
                AntiBotSystem::Datadome
            }
            Self::AkamaiLevel1 | Self::AkamaiLevel2 | Self::AkamaiLevel3 => AntiBotSystem::Akamai,
            Self::Funcaptcha => AntiBotSystem::Funcaptcha,
        }
    }

    /// Per-attempt deadline for one solver call on this challenge.
    #[must_use]
    pub fn attempt_timeout(self) -> Duration {
        match self {
            Self::RecaptchaV2Checkbox => Duration::from_secs(30),
            Self::RecaptchaV2Image => Duration::from_secs(60),
            Self::RecaptchaV3 => Duration::from_secs(10),
            Self::RecaptchaV2Invisible | Self::RecaptchaV2Audio => Duration::from_secs(30),
            Self::HcaptchaCheckbox | Self::HcaptchaAudio => Duration::from_secs(30),
            Self::HcaptchaInvisible | Self::HcaptchaAccessibility => Duration::from_secs(30),
            Self::DatadomeSensor => Duration::from_secs(30),
            Self::DatadomeCaptcha | Self::DatadomeSlider => Duration::from_secs(60),
            Self::AkamaiLevel1 => Duration::from_secs(2),
            Self::AkamaiLevel2 => Duration::from_secs(5),
            Self::AkamaiLevel3 => Duration::from_secs(10),
            Self::Turnstile => Duration::from_secs(30),
            Self::Funcaptcha => Duration::from_secs(60),
        }
    }
}

impl fmt::Display for ChallengeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// A detected challenge handed to the solver orchestrator.
#[derive(Debug, Clone)]
pub struct CaptchaChallenge {
    pub challenge_type: ChallengeType,
    pub page_url: String,
    pub sitekey: Option<String>,
    /// Detection confidence that produced this challenge
    pub confidence: f64,
    /// Set by the processor when the owning job is cancelled; solvers and the
    /// orchestrator check it between attempts
    pub cancelled: Arc<AtomicBool>,
}

impl CaptchaChallenge {
    #[must_use]
    pub fn new(challenge_type: ChallengeType, page_url: impl Into<String>) -> Self {
        Self {
            challenge_type,
            page_url: page_url.into(),
            sitekey: None,
            confidence: 1.0,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn with_sitekey(mut self, sitekey: impl Into<String>) -> Self {
        self.sitekey = Some(sitekey.into());
        self
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// What a successful solve produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SolutionKind {
    /// A response token to submit with the protected form
    Token,
    /// A clearance cookie already installed in the context
    Cookie,
}

/// Token or cookie accepted by the target, plus provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptchaSolution {
    pub kind: SolutionKind,
    pub value: String,
    pub solver_id: String,
    pub solved_at: DateTime<Utc>,
}

impl CaptchaSolution {
    #[must_use]
    pub fn token(solver_id: &str, value: impl Into<String>) -> Self {
        Self {
            kind: SolutionKind::Token,
            value: value.into(),
            solver_id: solver_id.to_string(),
            solved_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn cookie(solver_id: &str, value: impl Into<String>) -> Self {
        Self {
            kind: SolutionKind::Cookie,
            value: value.into(),
            solver_id: solver_id.to_string(),
            solved_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_table_matches_policy() {
        assert_eq!(ChallengeType::RecaptchaV2Checkbox.attempt_timeout(), Duration::from_secs(30));
        assert_eq!(ChallengeType::RecaptchaV2Image.attempt_timeout(), Duration::from_secs(60));
        assert_eq!(ChallengeType::RecaptchaV3.attempt_timeout(), Duration::from_secs(10));
        assert_eq!(ChallengeType::AkamaiLevel1.attempt_timeout(), Duration::from_secs(2));
        assert_eq!(ChallengeType::AkamaiLevel2.attempt_timeout(), Duration::from_secs(5));
        assert_eq!(ChallengeType::AkamaiLevel3.attempt_timeout(), Duration::from_secs(10));
        assert_eq!(ChallengeType::DatadomeCaptcha.attempt_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn every_challenge_maps_to_its_system() {
        assert_eq!(ChallengeType::RecaptchaV2Audio.system(), AntiBotSystem::Recaptcha);
        assert_eq!(ChallengeType::HcaptchaAccessibility.system(), AntiBotSystem::Hcaptcha);
        assert_eq!(ChallengeType::DatadomeSlider.system(), AntiBotSystem::Datadome);
        assert_eq!(ChallengeType::AkamaiLevel3.system(), AntiBotSystem::Akamai);
        assert_eq!(ChallengeType::Turnstile.system(), AntiBotSystem::Turnstile);
    }

    #[test]
    fn cancellation_flag_is_shared() {
        let challenge = CaptchaChallenge::new(ChallengeType::Turnstile, "https://example.com");
        let flag = Arc::clone(&challenge.cancelled);
        assert!(!challenge.is_cancelled());
        flag.store(true, std::sync::atomic::Ordering::Relaxed);
        assert!(challenge.is_cancelled());
    }
}
