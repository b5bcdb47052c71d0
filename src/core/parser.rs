//! LD-002: larder.yaml and export-file parsing and validation.
//!
//! Validates structural constraints of the config:
//! - Version must be "1.0"
//! - Region must be a known platform region
//! - Managed patterns must compile
//! - Retry budgets and concurrency must be positive

use super::types::*;
use regex::Regex;
use std::path::Path;

/// Validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Locale settings for one platform region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionLocale {
    pub code: &'static str,
    pub country_code: &'static str,
    pub language: &'static str,
    pub base_url: &'static str,
}

const REGIONS: &[RegionLocale] = &[
    RegionLocale {
        code: "es",
        country_code: "es",
        language: "es-ES",
        base_url: "https://cookidoo.es/foundation/es-ES",
    },
    RegionLocale {
        code: "de",
        country_code: "de",
        language: "de-DE",
        base_url: "https://cookidoo.de/foundation/de-DE",
    },
    RegionLocale {
        code: "fr",
        country_code: "fr",
        language: "fr-FR",
        base_url: "https://cookidoo.fr/foundation/fr-FR",
    },
    RegionLocale {
        code: "it",
        country_code: "it",
        language: "it-IT",
        base_url: "https://cookidoo.it/foundation/it-IT",
    },
    RegionLocale {
        code: "uk",
        country_code: "gb",
        language: "en-GB",
        base_url: "https://cookidoo.co.uk/foundation/en-GB",
    },
    RegionLocale {
        code: "us",
        country_code: "us",
        language: "en-US",
        base_url: "https://cookidoo.com/foundation/en-US",
    },
];

/// Look up a region code (case-insensitive).
pub fn region_locale(code: &str) -> Option<RegionLocale> {
    REGIONS
        .iter()
        .find(|r| r.code.eq_ignore_ascii_case(code.trim()))
        .copied()
}

/// All supported region codes.
pub fn region_codes() -> Vec<&'static str> {
    REGIONS.iter().map(|r| r.code).collect()
}

/// Parse a larder.yaml file from disk.
pub fn parse_config_file(path: &Path) -> Result<LarderConfig, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    parse_config(&content)
}

/// Parse a larder.yaml from a string.
pub fn parse_config(yaml: &str) -> Result<LarderConfig, String> {
    serde_yaml_ng::from_str(yaml).map_err(|e| format!("YAML parse error: {}", e))
}

/// Validate a parsed config. Returns a list of errors (empty = valid).
pub fn validate_config(config: &LarderConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if config.version != "1.0" {
        errors.push(ValidationError {
            message: format!("version must be \"1.0\", got \"{}\"", config.version),
        });
    }

    if config.name.is_empty() {
        errors.push(ValidationError {
            message: "name must not be empty".to_string(),
        });
    }

    if region_locale(&config.region).is_none() {
        errors.push(ValidationError {
            message: format!(
                "unknown region '{}' (expected one of: {})",
                config.region,
                region_codes().join(", ")
            ),
        });
    }

    for pattern in &config.rules.managed_patterns {
        if let Err(e) = Regex::new(pattern) {
            errors.push(ValidationError {
                message: format!("managed pattern '{}' does not compile: {}", pattern, e),
            });
        }
    }

    for (dish, name) in &config.rules.translations {
        if name.trim().is_empty() {
            errors.push(ValidationError {
                message: format!("translation for {} must not be empty", dish),
            });
        }
    }

    if config.classification.concurrency == 0 {
        errors.push(ValidationError {
            message: "classification.concurrency must be at least 1".to_string(),
        });
    }

    for (section, retry) in [
        ("classification", &config.classification.retry),
        ("execution", &config.execution.retry),
    ] {
        if retry.max_attempts == 0 {
            errors.push(ValidationError {
                message: format!("{}.retry.max_attempts must be at least 1", section),
            });
        }
        if !(retry.multiplier.is_finite() && retry.multiplier >= 1.0) {
            errors.push(ValidationError {
                message: format!(
                    "{}.retry.multiplier must be >= 1.0, got {}",
                    section, retry.multiplier
                ),
            });
        }
    }

    errors
}

/// Parse and validate in one step, joining validation errors.
pub fn parse_and_validate(path: &Path) -> Result<LarderConfig, String> {
    let config = parse_config_file(path)?;
    let errors = validate_config(&config);
    if errors.is_empty() {
        Ok(config)
    } else {
        let joined: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        Err(format!(
            "{} has {} validation error(s):\n  {}",
            path.display(),
            errors.len(),
            joined.join("\n  ")
        ))
    }
}

/// Parse export-file bytes.
pub fn parse_export(bytes: &[u8]) -> Result<ExportFile, String> {
    serde_json::from_slice(bytes).map_err(|e| format!("export JSON error: {}", e))
}
