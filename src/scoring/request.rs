//! FUJI evaluation request payload and reference-key validation.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ScoringError;

/// Longest reference key accepted.
pub const MAX_KEY_LEN: usize = 2048;

/// Evaluation options sent alongside every identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationOptions {
    pub test_debug: bool,
    pub metadata_service_endpoint: String,
    pub metadata_service_type: String,
    pub use_datacite: bool,
    pub use_github: bool,
    pub metric_version: String,
}

impl Default for EvaluationOptions {
    fn default() -> Self {
        Self {
            test_debug: true,
            metadata_service_endpoint: "http://ws.pangaea.de/oai/provider".to_string(),
            metadata_service_type: "oai_pmh".to_string(),
            use_datacite: true,
            use_github: false,
            metric_version: "metrics_v0.5".to_string(),
        }
    }
}

impl EvaluationOptions {
    pub fn with_metric_version(mut self, version: impl Into<String>) -> Self {
        self.metric_version = version.into();
        self
    }

    pub fn with_metadata_service(
        mut self,
        endpoint: impl Into<String>,
        service_type: impl Into<String>,
    ) -> Self {
        self.metadata_service_endpoint = endpoint.into();
        self.metadata_service_type = service_type.into();
        self
    }
}

/// Body of `POST /fuji/api/v1/evaluate`.
#[derive(Debug, Serialize)]
pub struct EvaluationRequest<'a> {
    pub object_identifier: &'a str,
    #[serde(flatten)]
    pub options: &'a EvaluationOptions,
}

impl<'a> EvaluationRequest<'a> {
    pub fn new(object_identifier: &'a str, options: &'a EvaluationOptions) -> Self {
        Self {
            object_identifier,
            options,
        }
    }
}

/// Rejects reference keys the service can never evaluate.
#[derive(Debug, Clone)]
pub struct KeyValidator {
    pattern: Regex,
}

impl KeyValidator {
    pub fn new() -> Result<Self, ScoringError> {
        let pattern = Regex::new(r"^[^\s\p{C}]+$")
            .map_err(|e| ScoringError::ClientBuild(format!("invalid key pattern: {e}")))?;
        Ok(Self { pattern })
    }

    /// Returns the trimmed key, or a permanent [`ScoringError::InvalidKey`].
    pub fn validate<'k>(&self, key: &'k str) -> Result<&'k str, ScoringError> {
        let trimmed = key.trim();
        let reason = if trimmed.is_empty() {
            Some("empty")
        } else if trimmed.len() > MAX_KEY_LEN {
            Some("too long")
        } else if !self.pattern.is_match(trimmed) {
            Some("contains whitespace or control characters")
        } else {
            None
        };

        match reason {
            None => Ok(trimmed),
            Some(reason) => Err(ScoringError::InvalidKey {
                key: key.chars().take(80).collect(),
                reason: reason.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serializes_flat() {
        let options = EvaluationOptions::default();
        let request = EvaluationRequest::new("10.1594/PANGAEA.123", &options);
        let json = serde_json::to_value(&request).expect("serialize");

        assert_eq!(json["object_identifier"], "10.1594/PANGAEA.123");
        assert_eq!(json["test_debug"], true);
        assert_eq!(json["metadata_service_type"], "oai_pmh");
        assert_eq!(json["use_datacite"], true);
        assert_eq!(json["use_github"], false);
        assert_eq!(json["metric_version"], "metrics_v0.5");
    }

    #[test]
    fn test_options_builders() {
        let options = EvaluationOptions::default()
            .with_metric_version("metrics_v0.7")
            .with_metadata_service("http://example.org/oai", "oai_pmh");
        assert_eq!(options.metric_version, "metrics_v0.7");
        assert_eq!(options.metadata_service_endpoint, "http://example.org/oai");
    }

    #[test]
    fn test_valid_keys() {
        let validator = KeyValidator::new().expect("validator");
        assert_eq!(
            validator.validate("10.1594/PANGAEA.123").expect("doi"),
            "10.1594/PANGAEA.123"
        );
        assert_eq!(
            validator.validate("  https://doi.org/10.5281/zenodo.1 ").expect("url"),
            "https://doi.org/10.5281/zenodo.1"
        );
    }

    #[test]
    fn test_invalid_keys() {
        let validator = KeyValidator::new().expect("validator");
        for key in ["", "   ", "10.1/with space", "10.1/tab\tinside", "10.1/\u{0007}"] {
            let err = validator.validate(key).expect_err(key);
            assert!(!err.is_transient());
        }

        let long = format!("10.1/{}", "a".repeat(MAX_KEY_LEN));
        assert!(validator.validate(&long).is_err());
    }
}
