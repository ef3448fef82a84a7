//! Error types for E2E testing

use thiserror::Error;

#[derive(Error, Debug)]
pub enum E2eError {
    #[error("Server failed to start: {0}")]
    ServerStartup(String),

    #[error("Server health check failed for {url} after {attempts} attempts")]
    ServerHealthCheck { url: String, attempts: usize },

    #[error("Playwright not found. Install with: npx playwright install")]
    PlaywrightNotFound,

    #[error("Driver error: {0}")]
    Driver(String),

    #[error("Browser bridge closed unexpectedly")]
    BridgeClosed,

    #[error("Fixture error: {0}")]
    Fixture(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Scenario spec error: {0}")]
    SpecParse(String),

    #[error("Invalid selector: {0}")]
    Selector(String),

    #[error("Expected {expected}, but {actual}")]
    Assertion { expected: String, actual: String },

    #[error("Timed out after {timeout_ms}ms waiting for {what}")]
    Timeout { what: String, timeout_ms: u64 },

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

impl E2eError {
    pub fn assertion(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        E2eError::Assertion {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Whether this error is a failed expectation rather than a harness fault.
    /// Wait timeouts count as failed expectations.
    pub fn is_expectation(&self) -> bool {
        matches!(self, E2eError::Assertion { .. } | E2eError::Timeout { .. })
    }
}

pub type E2eResult<T> = Result<T, E2eError>;
