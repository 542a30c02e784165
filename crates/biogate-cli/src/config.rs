use anyhow::{Context, Result};
use biogate_core::{BiometricConfig, VerificationPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// ONNX model file names inside `model_dir`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelFiles {
    pub detector: String,
    pub landmarks: String,
    pub encoder: String,
    /// Tag stored with every face encoding produced by `encoder`.
    pub encoder_version: String,
}

impl Default for ModelFiles {
    fn default() -> Self {
        Self {
            detector: "det_10g.onnx".to_string(),
            landmarks: "landmarks_68.onnx".to_string(),
            encoder: "w600k_r50.onnx".to_string(),
            encoder_version: "w600k_r50".to_string(),
        }
    }
}

/// Process settings: optional TOML file, then `BIOGATE_*` overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// SQLite database holding templates and attempt counters.
    pub db_path: PathBuf,
    pub models: ModelFiles,
    pub biometric: BiometricConfig,
    /// Defaults for `verify`; command-line flags can tighten or relax them.
    pub policy: VerificationPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model_dir: biogate_core::default_model_dir(),
            db_path: data_dir().join("biogate.db"),
            models: ModelFiles::default(),
            biometric: BiometricConfig::default(),
            policy: VerificationPolicy::default(),
        }
    }
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("biogate")
}

impl Settings {
    /// Load from `path`, else from `BIOGATE_CONFIG`, else defaults; then
    /// apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("BIOGATE_CONFIG").ok().map(PathBuf::from));

        let mut settings = match path {
            Some(path) => {
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                Self::from_toml(&text).with_context(|| format!("parsing config {}", path.display()))?
            }
            None => Self::default(),
        };
        settings.apply_overrides(|key| std::env::var(key).ok());
        Ok(settings)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `BIOGATE_*` overrides read through `lookup`. Unparseable
    /// values leave the current setting untouched.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("BIOGATE_MODEL_DIR") {
            self.model_dir = PathBuf::from(dir);
        }
        if let Some(db) = lookup("BIOGATE_DB_PATH") {
            self.db_path = PathBuf::from(db);
        }

        let bio = &mut self.biometric;
        bio.face.match_threshold = env_f32(&lookup, "BIOGATE_FACE_THRESHOLD", bio.face.match_threshold);
        bio.face.detection_confidence =
            env_f32(&lookup, "BIOGATE_DETECTION_CONFIDENCE", bio.face.detection_confidence);
        bio.liveness.ear_threshold = env_f32(&lookup, "BIOGATE_EAR_THRESHOLD", bio.liveness.ear_threshold);
        bio.liveness.min_blinks = env_u32(&lookup, "BIOGATE_MIN_BLINKS", bio.liveness.min_blinks);
        bio.voice.match_threshold = env_f64(&lookup, "BIOGATE_VOICE_THRESHOLD", bio.voice.match_threshold);
        bio.lockout.max_attempts = env_u32(&lookup, "BIOGATE_MAX_ATTEMPTS", bio.lockout.max_attempts);
        bio.lockout.window_secs = env_u64(&lookup, "BIOGATE_LOCKOUT_SECS", bio.lockout.window_secs);

        if let Some(v) = lookup("BIOGATE_REQUIRE_VOICE") {
            self.policy.require_voice = v != "0";
        }
    }

    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.models.detector)
    }

    pub fn landmark_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.models.landmarks)
    }

    pub fn encoder_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.models.encoder)
    }
}

fn env_f32(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: f32) -> f32 {
    lookup(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_f64(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: f64) -> f64 {
    lookup(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u32) -> u32 {
    lookup(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> u64 {
    lookup(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let s = Settings::from_toml(
            r#"
            db_path = "/var/lib/biogate/biogate.db"

            [biometric.face]
            match_threshold = 0.5

            [biometric.lockout]
            max_attempts = 5
            "#,
        )
        .unwrap();
        assert_eq!(s.db_path, PathBuf::from("/var/lib/biogate/biogate.db"));
        assert_eq!(s.biometric.face.match_threshold, 0.5);
        assert_eq!(s.biometric.face.detection_confidence, 0.8);
        assert_eq!(s.biometric.lockout.max_attempts, 5);
        assert_eq!(s.biometric.lockout.window_secs, 300);
        assert_eq!(s.models, ModelFiles::default());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("BIOGATE_MODEL_DIR", "/opt/models"),
            ("BIOGATE_FACE_THRESHOLD", "0.45"),
            ("BIOGATE_MAX_ATTEMPTS", "7"),
            ("BIOGATE_VOICE_THRESHOLD", "not-a-number"),
            ("BIOGATE_REQUIRE_VOICE", "1"),
        ]
        .into_iter()
        .collect();

        let mut s = Settings::default();
        s.apply_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(s.model_dir, PathBuf::from("/opt/models"));
        assert_eq!(s.biometric.face.match_threshold, 0.45);
        assert_eq!(s.biometric.lockout.max_attempts, 7);
        assert_eq!(s.biometric.voice.match_threshold, 0.75);
        assert!(s.policy.require_voice);
        assert_eq!(s.detector_model_path(), PathBuf::from("/opt/models/det_10g.onnx"));
    }

    #[test]
    fn test_policy_lockout_from_toml() {
        let s = Settings::from_toml("[policy]\nmax_attempts = 1\nlockout_window_secs = 60").unwrap();
        assert_eq!(s.policy.max_attempts, Some(1));
        assert_eq!(s.policy.lockout_window_secs, Some(60));
        assert!(s.policy.require_liveness);
        let lockout = s.policy.lockout(&s.biometric.lockout);
        assert_eq!((lockout.max_attempts, lockout.window_secs), (1, 60));
    }

    #[test]
    fn test_unknown_table_value_rejected() {
        assert!(Settings::from_toml("[biometric.face]\nmatch_threshold = \"high\"").is_err());
    }
}
