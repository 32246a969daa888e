//! Error types for scenario execution

use thiserror::Error;

#[derive(Error, Debug)]
pub enum E2eError {
    #[error("Session setup failed: {0}")]
    Setup(String),

    #[error("Driver error: {0}")]
    Driver(String),

    #[error("Element not found: {locator} ({observed})")]
    NotFound { locator: String, observed: String },

    #[error("Stale element: {0}")]
    StaleElement(String),

    #[error("Element not interactable: {locator} ({observed})")]
    ElementNotInteractable { locator: String, observed: String },

    #[error("{}expected {expected}; observed {observed}", prefix(.message))]
    AssertionFailed {
        message: Option<String>,
        expected: String,
        observed: String,
    },

    #[error("Timeout after {waited_ms} ms waiting for: {what}")]
    TimedOut { what: String, waited_ms: u64 },

    #[error("Scenario budget of {budget_ms} ms exhausted")]
    BudgetExhausted { budget_ms: u64 },

    #[error("Scenario parse error: {0}")]
    ScenarioParse(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Config error: {0}")]
    Config(#[from] ::config::ConfigError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

fn prefix(message: &Option<String>) -> String {
    match message {
        Some(m) => format!("Assertion failed: {}: ", m),
        None => "Assertion failed: ".to_string(),
    }
}

impl E2eError {
    /// Errors that mean "could not test" rather than "test failed".
    pub fn is_environmental(&self) -> bool {
        matches!(self, E2eError::Setup(_) | E2eError::BudgetExhausted { .. })
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, E2eError::StaleElement(_))
    }

    /// Read errors a later poll can recover from: frames detach and
    /// elements re-render while the page reflows.
    pub fn is_transient(&self) -> bool {
        matches!(self, E2eError::Driver(_) | E2eError::StaleElement(_))
    }
}

pub type E2eResult<T> = Result<T, E2eError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assertion_message_is_verbatim() {
        let err = E2eError::AssertionFailed {
            message: Some("dashboard did not load".to_string()),
            expected: "text \"Dashboard\" visible".to_string(),
            observed: "no match".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Assertion failed: dashboard did not load: expected text \"Dashboard\" visible; observed no match"
        );
    }

    #[test]
    fn test_environmental_classification() {
        assert!(E2eError::Setup("no chromedriver".into()).is_environmental());
        assert!(E2eError::BudgetExhausted { budget_ms: 10 }.is_environmental());
        assert!(!E2eError::StaleElement("x".into()).is_environmental());
        assert!(!E2eError::TimedOut { what: "x".into(), waited_ms: 1 }.is_environmental());
    }
}
