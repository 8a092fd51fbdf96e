//! Configuration loading and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};
use crate::types::RecognitionParams;

/// Top-level voxrelay configuration.
///
/// The gateway and the synthesis service read the same file; each one only
/// requires the sections it actually uses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub logging: LoggingConfig,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream: Option<UpstreamConfig>,

    #[serde(default)]
    pub recognition: RecognitionParams,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts: Option<TtsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Base log level (trace/debug/info/warn/error).
    pub level: String,

    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Per-crate log level overrides (e.g. "voxrelay_media=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Duplex gateway bind address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
}

impl GatewayConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Addresses and timeouts of the external recognition and synthesis services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// HTTP endpoint accepting multipart PCM uploads.
    pub asr_url: String,

    /// WebSocket endpoint of the synthesis service.
    pub tts_ws_url: String,

    pub http_timeout_secs: f64,

    pub ws_timeout_secs: f64,
}

impl UpstreamConfig {
    pub fn http_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.http_timeout_secs).unwrap_or(Duration::ZERO)
    }

    pub fn ws_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.ws_timeout_secs).unwrap_or(Duration::ZERO)
    }
}

/// Synthesis service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    pub host: String,
    pub port: u16,

    /// Directory holding voice model files. `~` is expanded.
    pub models_dir: String,

    /// Voice model file name inside `models_dir`.
    pub voice: String,

    /// Output sample rate of the voice model (16-bit mono PCM).
    pub sample_rate: u32,

    /// Playback duration of one output window.
    pub chunk_ms: u32,

    /// Synthesis executable, looked up on `PATH` when not absolute (default: "piper").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binary: Option<String>,
}

impl TtsConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn binary(&self) -> &str {
        self.binary.as_deref().unwrap_or("piper")
    }

    /// Full path of the configured voice model.
    pub fn model_path(&self) -> PathBuf {
        let dir = shellexpand::tilde(&self.models_dir);
        PathBuf::from(dir.as_ref()).join(&self.voice)
    }
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    let Ok(re) = regex::Regex::new(r"\$\{([^}]+)\}") else {
        return input.to_string();
    };
    re.replace_all(input, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(RelayError::Config(format!(
                "config file not found: {}",
                path.display()
            )));
        }

        let raw = std::fs::read_to_string(path)?;
        Self::from_json5(&raw)
    }

    /// Parse config text, substituting `${ENV_VAR}` references first.
    pub fn from_json5(raw: &str) -> Result<Self> {
        let substituted = substitute_env_vars(raw);
        json5::from_str(&substituted).map_err(|e| RelayError::Config(e.to_string()))
    }

    /// Default config location: `~/.voxrelay/config.json5`.
    pub fn default_path() -> PathBuf {
        data_dir().join("config.json5")
    }

    pub fn gateway(&self) -> Result<&GatewayConfig> {
        self.gateway.as_ref().ok_or_else(|| missing_section("gateway"))
    }

    pub fn upstream(&self) -> Result<&UpstreamConfig> {
        self.upstream.as_ref().ok_or_else(|| missing_section("upstream"))
    }

    pub fn tts(&self) -> Result<&TtsConfig> {
        self.tts.as_ref().ok_or_else(|| missing_section("tts"))
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if let Some(gw) = &self.gateway {
            if gw.port == 0 {
                errors.push("Gateway port cannot be 0".to_string());
            }
        }

        if let Some(up) = &self.upstream {
            if !(up.asr_url.starts_with("http://") || up.asr_url.starts_with("https://")) {
                errors.push(format!("upstream.asr_url must be http(s): {}", up.asr_url));
            }
            if !(up.tts_ws_url.starts_with("ws://") || up.tts_ws_url.starts_with("wss://")) {
                errors.push(format!(
                    "upstream.tts_ws_url must be ws(s): {}",
                    up.tts_ws_url
                ));
            }
            if up.http_timeout().is_zero() {
                errors.push("upstream.http_timeout_secs must be positive".to_string());
            }
            if up.ws_timeout().is_zero() {
                errors.push("upstream.ws_timeout_secs must be positive".to_string());
            }
        }

        if self.recognition.sample_rate == 0 {
            errors.push("recognition.sample_rate cannot be 0".to_string());
        }
        if !(1..=2).contains(&self.recognition.channels) {
            errors.push(format!(
                "recognition.channels must be 1 or 2, got {}",
                self.recognition.channels
            ));
        }

        if let Some(tts) = &self.tts {
            if tts.port == 0 {
                errors.push("TTS port cannot be 0".to_string());
            }
            if tts.sample_rate == 0 {
                errors.push("tts.sample_rate cannot be 0".to_string());
            }
            if tts.chunk_ms == 0 {
                errors.push("tts.chunk_ms cannot be 0".to_string());
            }
            let window = u64::from(tts.sample_rate) * 2 * u64::from(tts.chunk_ms) / 1000;
            if tts.chunk_ms > 0 && window % 2 != 0 {
                warnings.push(format!(
                    "tts window of {window} bytes splits a 16-bit sample; pick a chunk_ms that divides evenly"
                ));
            }
            if !tts.model_path().exists() {
                warnings.push(format!(
                    "Voice model not found at {}",
                    tts.model_path().display()
                ));
            }
        }

        if !matches!(self.logging.format.as_str(), "plain" | "json") {
            warnings.push(format!(
                "Unknown logging.format '{}', using plain",
                self.logging.format
            ));
        }

        (warnings, errors)
    }
}

fn missing_section(name: &str) -> RelayError {
    RelayError::Config(format!("missing `{name}` section"))
}

/// Base directory for voxrelay data: `~/.voxrelay/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".voxrelay")
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"{
        logging: { level: "info" },
        gateway: { host: "0.0.0.0", port: 8000 },
        upstream: {
            asr_url: "http://asr:8001/api/stt/bytes",
            tts_ws_url: "ws://tts:8002/ws/tts",
            http_timeout_secs: 30.0,
            ws_timeout_secs: 60,
        },
        tts: {
            host: "0.0.0.0",
            port: 8002,
            models_dir: "/app/models",
            voice: "en-us-lessac-medium.onnx",
            sample_rate: 22050,
            chunk_ms: 80,
        },
    }"#;

    #[test]
    fn test_parse_full_config() {
        let config = Config::from_json5(FULL).unwrap();
        assert_eq!(config.gateway().unwrap().bind_addr(), "0.0.0.0:8000");

        let upstream = config.upstream().unwrap();
        assert_eq!(upstream.http_timeout(), Duration::from_secs(30));
        assert_eq!(upstream.ws_timeout(), Duration::from_secs(60));

        let tts = config.tts().unwrap();
        assert_eq!(tts.binary(), "piper");
        assert_eq!(
            tts.model_path(),
            PathBuf::from("/app/models/en-us-lessac-medium.onnx")
        );

        assert_eq!(config.recognition, RecognitionParams::default());
        assert_eq!(config.logging.format, "plain");
        assert_eq!(config.logging.output, "stderr");
    }

    #[test]
    fn test_missing_section_is_config_error() {
        let config = Config::from_json5(r#"{ logging: { level: "debug" } }"#).unwrap();
        let err = config.tts().unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
        assert!(err.to_string().contains("tts"));
    }

    #[test]
    fn test_required_field_has_no_default() {
        let result = Config::from_json5(
            r#"{ logging: { level: "info" }, gateway: { host: "127.0.0.1" } }"#,
        );
        assert!(matches!(result, Err(RelayError::Config(_))));

        assert!(Config::from_json5("{}").is_err());
    }

    #[test]
    fn test_env_var_substitution() {
        // SAFETY: test-only, the variable name is unique to this test
        unsafe { std::env::set_var("VOXRELAY_TEST_ASR_HOST", "asr.internal") };
        let input = r#"{"url": "http://${VOXRELAY_TEST_ASR_HOST}:8001"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains("http://asr.internal:8001"));
        unsafe { std::env::remove_var("VOXRELAY_TEST_ASR_HOST") };
    }

    #[test]
    fn test_env_var_missing() {
        let input = r#"{"key": "${NONEXISTENT_VAR_VOXRELAY_TEST}"}"#;
        let result = substitute_env_vars(input);
        assert_eq!(result, r#"{"key": ""}"#);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json5");
        std::fs::write(&path, FULL).unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.tts().unwrap().sample_rate, 22050);

        let missing = Config::load(&dir.path().join("absent.json5"));
        assert!(matches!(missing, Err(RelayError::Config(_))));
    }

    #[test]
    fn test_validate_flags_bad_values() {
        let mut config = Config::from_json5(FULL).unwrap();
        if let Some(up) = config.upstream.as_mut() {
            up.tts_ws_url = "http://tts:8002/ws/tts".into();
            up.http_timeout_secs = -1.0;
        }
        if let Some(tts) = config.tts.as_mut() {
            tts.chunk_ms = 0;
        }
        let (warnings, errors) = config.validate();
        assert!(errors.iter().any(|e| e.contains("tts_ws_url")));
        assert!(errors.iter().any(|e| e.contains("http_timeout_secs")));
        assert!(errors.iter().any(|e| e.contains("chunk_ms")));
        // /app/models does not exist on the test host
        assert!(warnings.iter().any(|w| w.contains("Voice model")));
    }

    #[test]
    fn test_validate_odd_window_warns() {
        let mut config = Config::from_json5(FULL).unwrap();
        if let Some(tts) = config.tts.as_mut() {
            // 22050 * 2 * 11 / 1000 = 485.1 -> 485 bytes
            tts.chunk_ms = 11;
        }
        let (warnings, _errors) = config.validate();
        assert!(warnings.iter().any(|w| w.contains("splits a 16-bit sample")));
    }
}
