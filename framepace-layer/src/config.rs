//! Layer configuration.
//!
//! An injected cdylib has no command line, so configuration comes from
//! two places, in increasing precedence:
//!
//! 1. a JSON file named by the `FRAMEPACE_CONFIG` environment variable;
//! 2. individual `FRAMEPACE_*` environment variables.
//!
//! A missing file, a malformed file, or a malformed variable never
//! breaks the host's rendering: the offending input is logged as a
//! warning and the default value is kept.

use std::sync::LazyLock;

use serde::Deserialize;

/// Everything the layer can be told from outside the process.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LayerConfig {
    /// Master switch. When false every present takes the bypass path.
    pub enabled: bool,
    /// Frame-time budget handed to the pacing controller, milliseconds.
    pub target_frame_time_ms: f32,
    /// Initial synthesis quality, clamped to [0, 1].
    pub quality: f32,
    /// Initial synthesiser resolution scale, clamped to [0.25, 0.75].
    pub model_scale: f32,
    /// When false the controller skips its temperature branches.
    pub thermal_protection: bool,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            target_frame_time_ms: 8.0,
            quality: 0.5,
            model_scale: 0.5,
            thermal_protection: true,
        }
    }
}

static CONFIG: LazyLock<LayerConfig> = LazyLock::new(LayerConfig::load);

impl LayerConfig {
    /// The process-wide configuration, resolved once on first use.
    pub fn get() -> &'static LayerConfig {
        &CONFIG
    }

    fn load() -> Self {
        let file = std::env::var_os("FRAMEPACE_CONFIG").and_then(|path| {
            match std::fs::read_to_string(&path) {
                Ok(text) => Some(text),
                Err(e) => {
                    tracing::warn!(
                        target: crate::log::TARGET,
                        "Could not read config file {path:?}: {e}"
                    );
                    None
                }
            }
        });
        let env = std::env::vars().filter(|(k, _)| k.starts_with("FRAMEPACE_"));
        Self::from_sources(file.as_deref(), env)
    }

    /// Build a configuration from an optional JSON document plus
    /// `FRAMEPACE_*` variable overrides. Split out from [`load`] so the
    /// precedence rules are testable without touching the environment.
    fn from_sources(
        file: Option<&str>,
        env: impl Iterator<Item = (String, String)>,
    ) -> Self {
        let mut config = match file {
            Some(text) => match serde_json::from_str::<LayerConfig>(text) {
                Ok(parsed) => parsed,
                Err(e) => {
                    tracing::warn!(
                        target: crate::log::TARGET,
                        "Malformed config file, using defaults: {e}"
                    );
                    Self::default()
                }
            },
            None => Self::default(),
        };

        for (key, value) in env {
            config.apply_env(&key, &value);
        }

        config.quality = config.quality.clamp(0.0, 1.0);
        config.model_scale = config.model_scale.clamp(0.25, 0.75);
        config
    }

    fn apply_env(&mut self, key: &str, value: &str) {
        let outcome = match key {
            "FRAMEPACE_ENABLED" => {
                parse_bool(value).map(|v| self.enabled = v)
            }
            "FRAMEPACE_TARGET_FRAME_TIME_MS" => value
                .parse()
                .ok()
                .map(|v: f32| self.target_frame_time_ms = v),
            "FRAMEPACE_QUALITY" => {
                value.parse().ok().map(|v: f32| self.quality = v)
            }
            "FRAMEPACE_MODEL_SCALE" => {
                value.parse().ok().map(|v: f32| self.model_scale = v)
            }
            "FRAMEPACE_THERMAL_PROTECTION" => {
                parse_bool(value).map(|v| self.thermal_protection = v)
            }
            // FRAMEPACE_CONFIG and FRAMEPACE_LOG are consumed elsewhere.
            _ => return,
        };
        if outcome.is_none() {
            tracing::warn!(
                target: crate::log::TARGET,
                "Ignoring unparsable {key}={value:?}"
            );
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "true" | "TRUE" | "on" => Some(true),
        "0" | "false" | "FALSE" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_when_no_sources() {
        let config = LayerConfig::from_sources(None, std::iter::empty());
        assert_eq!(config, LayerConfig::default());
    }

    #[test]
    fn file_overrides_defaults() {
        let config = LayerConfig::from_sources(
            Some(r#"{"enabled": false, "target_frame_time_ms": 16.6}"#),
            std::iter::empty(),
        );
        assert!(!config.enabled);
        assert_eq!(config.target_frame_time_ms, 16.6);
        // Untouched fields keep their defaults.
        assert_eq!(config.quality, 0.5);
    }

    #[test]
    fn env_overrides_file() {
        let config = LayerConfig::from_sources(
            Some(r#"{"quality": 0.9}"#),
            env(&[
                ("FRAMEPACE_QUALITY", "0.2"),
                ("FRAMEPACE_THERMAL_PROTECTION", "off"),
            ])
            .into_iter(),
        );
        assert_eq!(config.quality, 0.2);
        assert!(!config.thermal_protection);
    }

    #[test]
    fn malformed_file_degrades_to_defaults() {
        let config =
            LayerConfig::from_sources(Some("not json"), std::iter::empty());
        assert_eq!(config, LayerConfig::default());
    }

    #[test]
    fn malformed_env_value_is_ignored() {
        let config = LayerConfig::from_sources(
            None,
            env(&[("FRAMEPACE_ENABLED", "maybe")]).into_iter(),
        );
        assert!(config.enabled);
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        let config = LayerConfig::from_sources(
            Some(r#"{"quality": 3.0, "model_scale": 0.1}"#),
            std::iter::empty(),
        );
        assert_eq!(config.quality, 1.0);
        assert_eq!(config.model_scale, 0.25);
    }
}
