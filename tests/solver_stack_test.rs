//! Wiring of the default solver stack and the detection registry.

use std::sync::Arc;

use browsermill::captcha::audio::AudioPipeline;
use browsermill::captcha::detection::{DetectionRegistry, PageSnapshot};
use browsermill::captcha::solver::build_default_registry;
use browsermill::captcha::types::AntiBotSystem;
use browsermill::captcha::widget::WidgetInteractor;
use browsermill::config::{AudioConfig, CaptchaConfig, HumanInputConfig};

fn stack(config: &CaptchaConfig) -> Arc<browsermill::captcha::solver::SolverRegistry> {
    let interactor = Arc::new(WidgetInteractor::new(HumanInputConfig::default(), config));
    let audio = Arc::new(AudioPipeline::from_config(AudioConfig::default()));
    build_default_registry(config, interactor, audio)
}

#[tokio::test]
async fn native_solvers_register_unconditionally() {
    let registry = stack(&CaptchaConfig::default());
    for id in [
        "recaptcha-native",
        "hcaptcha-native",
        "turnstile-native",
        "datadome-native",
        "akamai-native",
    ] {
        assert!(registry.get(id).is_some(), "missing native solver {id}");
    }
    assert!(registry.get("2captcha").is_none());
    assert!(registry.get("anticaptcha").is_none());
}

#[tokio::test]
async fn external_solvers_register_with_keys_only() {
    let mut config = CaptchaConfig::default();
    config.twocaptcha_api_keys = vec!["key-a".to_string(), "key-b".to_string()];
    config.anticaptcha_api_keys = vec!["key-c".to_string()];
    let registry = stack(&config);

    let two = registry.get("2captcha").expect("2captcha registered");
    assert!(two.supported.contains(&AntiBotSystem::Recaptcha));
    assert!(two.supported.contains(&AntiBotSystem::Funcaptcha));
    assert!(registry.get("anticaptcha").is_some());

    // External adapters rank below the native solvers
    let native = registry.get("recaptcha-native").expect("native registered");
    assert!(native.priority > two.priority);
}

#[tokio::test]
async fn native_solver_wins_candidate_ranking_for_recaptcha() {
    let mut config = CaptchaConfig::default();
    config.twocaptcha_api_keys = vec!["key".to_string()];
    let registry = stack(&config);

    let candidates = registry.candidates_for(AntiBotSystem::Recaptcha);
    assert_eq!(candidates.len(), 2);
    assert_eq!(candidates[0].name(), "recaptcha-native");
    assert_eq!(candidates[1].name(), "2captcha");
}

#[test]
fn recaptcha_checkbox_page_scores_strongly() {
    let registry = DetectionRegistry::with_defaults(&CaptchaConfig::default());
    let snapshot = PageSnapshot {
        url: "https://target.example/login".to_string(),
        iframe_srcs: vec![
            "https://www.google.com/recaptcha/api2/anchor?ar=1&k=sitekey".to_string(),
        ],
        selectors_present: vec![
            ".g-recaptcha".to_string(),
            "textarea[name=g-recaptcha-response]".to_string(),
        ],
        cookie_names: vec![],
        globals_present: vec!["grecaptcha".to_string()],
    };
    let detections = registry.aggregate(&snapshot);
    assert_eq!(detections[0].system, AntiBotSystem::Recaptcha);
    assert!(detections[0].confidence >= 0.9);
    assert!(registry.is_actionable(&detections[0]));
}
