use facegate_core::{AugmentProfile, EmbedderKind};
use std::path::PathBuf;
use std::str::FromStr;

/// Runtime configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Embedder variant (`onnx` or `center-crop`).
    pub embedder: EmbedderKind,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite identity database.
    pub db_path: PathBuf,
    /// Default cosine similarity threshold for a positive match.
    pub similarity_threshold: f32,
    /// Synthetic samples generated per enrollment.
    pub synthetic_samples: usize,
    pub augment_profile: AugmentProfile,
    /// Threads used for synthetic-sample generation.
    pub synthesis_workers: usize,
    /// Reply to enroll after the primary commit and synthesise afterwards.
    pub defer_synthesis: bool,
    /// Refuse enrollments whose primary embedding came from the center-crop fallback.
    pub reject_degraded: bool,
    /// Timeout in seconds for each engine request.
    pub request_timeout_secs: u64,
}

impl Config {
    /// Load configuration from `FACEGATE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let model_dir = std::env::var("FACEGATE_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| facegate_core::default_model_dir());

        let db_path = std::env::var("FACEGATE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| facegate_core::data_dir().join("identities.db"));

        Self {
            embedder: env_parse("FACEGATE_EMBEDDER", EmbedderKind::Onnx),
            model_dir,
            db_path,
            similarity_threshold: env_parse("FACEGATE_SIMILARITY_THRESHOLD", 0.5),
            synthetic_samples: env_parse("FACEGATE_SYNTHETIC_SAMPLES", 5),
            augment_profile: env_parse("FACEGATE_AUGMENT_PROFILE", AugmentProfile::Standard),
            synthesis_workers: env_parse("FACEGATE_SYNTHESIS_WORKERS", 1),
            defer_synthesis: env_flag("FACEGATE_DEFER_SYNTHESIS", false),
            reject_degraded: env_flag("FACEGATE_REJECT_DEGRADED", false),
            request_timeout_secs: env_parse("FACEGATE_REQUEST_TIMEOUT_SECS", 30),
        }
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => parse_or(key, &raw, default),
        Err(_) => default,
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| parse_flag(&v))
        .unwrap_or(default)
}

fn parse_or<T: FromStr>(key: &str, raw: &str, default: T) -> T {
    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            tracing::warn!(key, value = raw, "ignoring unparseable setting, using default");
            default
        }
    }
}

fn parse_flag(raw: &str) -> bool {
    !matches!(raw.trim(), "" | "0" | "false" | "no" | "off")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("1"));
        assert!(parse_flag("true"));
        assert!(!parse_flag("0"));
        assert!(!parse_flag(" off "));
        assert!(!parse_flag(""));
    }

    #[test]
    fn test_parse_or_falls_back() {
        assert_eq!(parse_or("K", "0.7", 0.5f32), 0.7);
        assert_eq!(parse_or("K", "high", 0.5f32), 0.5);
        assert_eq!(parse_or("K", " 8 ", 5usize), 8);
        assert_eq!(parse_or("K", "center-crop", EmbedderKind::Onnx), EmbedderKind::CenterCrop);
        assert_eq!(parse_or("K", "heavy", AugmentProfile::Standard), AugmentProfile::Heavy);
        assert_eq!(parse_or("K", "bogus", AugmentProfile::Standard), AugmentProfile::Standard);
    }
}
