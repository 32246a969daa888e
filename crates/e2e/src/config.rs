//! Runner configuration
//!
//! Layering: built-in defaults, then a TOML file (if present), then
//! `UIFLOW_*` environment variables. The CLI applies its flags last.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{E2eError, E2eResult};

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "UIFLOW";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Base URL of the application under test
    pub base_url: String,

    /// Wait and budget settings
    #[serde(flatten)]
    pub timing: Timing,

    /// Browser launch settings
    pub browser: BrowserConfig,

    /// Directory scanned for scenario files
    pub scenarios_dir: PathBuf,

    /// Output directory for results
    pub output_dir: PathBuf,

    /// Scenarios allowed to run at once, each with its own session
    pub concurrency: usize,

    /// Values for `${NAME}` placeholders in scenarios
    pub vars: BTreeMap<String, String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            timing: Timing::default(),
            browser: BrowserConfig::default(),
            scenarios_dir: PathBuf::from("scenarios"),
            output_dir: PathBuf::from("test-results"),
            concurrency: 1,
            vars: BTreeMap::new(),
        }
    }
}

/// Timeouts in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    pub action_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub navigation_timeout_ms: u64,
    pub load_timeout_ms: u64,
    pub settle_ms: u64,
    pub scenario_deadline_ms: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            action_timeout_ms: 5_000,
            poll_interval_ms: 100,
            navigation_timeout_ms: 10_000,
            load_timeout_ms: 3_000,
            settle_ms: 500,
            scenario_deadline_ms: 60_000,
        }
    }
}

impl Timing {
    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_millis(self.navigation_timeout_ms)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn scenario_deadline(&self) -> Duration {
        Duration::from_millis(self.scenario_deadline_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserKind {
    #[default]
    Chrome,
    Firefox,
}

impl BrowserKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrowserKind::Chrome => "chrome",
            BrowserKind::Firefox => "firefox",
        }
    }

    /// Driver executable looked up on PATH when none is configured
    pub fn driver_binary(&self) -> &'static str {
        match self {
            BrowserKind::Chrome => "chromedriver",
            BrowserKind::Firefox => "geckodriver",
        }
    }
}

impl FromStr for BrowserKind {
    type Err = E2eError;

    fn from_str(s: &str) -> E2eResult<Self> {
        match s.to_lowercase().as_str() {
            "chrome" | "chromium" => Ok(BrowserKind::Chrome),
            "firefox" => Ok(BrowserKind::Firefox),
            other => Err(E2eError::InvalidConfig(format!("unsupported browser: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self { width: 1280, height: 720 }
    }
}

impl FromStr for Viewport {
    type Err = E2eError;

    /// Parses `WIDTHxHEIGHT`
    fn from_str(s: &str) -> E2eResult<Self> {
        let bad = || E2eError::InvalidConfig(format!("viewport must be WIDTHxHEIGHT, got '{}'", s));
        let (w, h) = s.split_once(['x', 'X']).ok_or_else(bad)?;
        let width = w.trim().parse().map_err(|_| bad())?;
        let height = h.trim().parse().map_err(|_| bad())?;
        if width == 0 || height == 0 {
            return Err(bad());
        }
        Ok(Self { width, height })
    }
}

/// Browser launch settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub kind: BrowserKind,
    pub headless: bool,
    pub viewport: Viewport,
    /// Extra command-line arguments passed to the browser
    pub args: Vec<String>,
    pub webdriver: WebDriverConfig,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            kind: BrowserKind::Chrome,
            headless: true,
            viewport: Viewport::default(),
            args: vec!["--disable-dev-shm-usage".to_string()],
            webdriver: WebDriverConfig::default(),
        }
    }
}

/// Where the WebDriver endpoint comes from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebDriverConfig {
    /// Connect to an already running endpoint instead of spawning one
    pub url: Option<String>,
    /// Driver executable (defaults to chromedriver/geckodriver on PATH)
    pub binary: Option<PathBuf>,
    /// Port for the spawned driver (None = pick a free port)
    pub port: Option<u16>,
    pub startup_timeout_ms: u64,
}

impl Default for WebDriverConfig {
    fn default() -> Self {
        Self {
            url: None,
            binary: None,
            port: None,
            startup_timeout_ms: 30_000,
        }
    }
}

impl RunnerConfig {
    /// Load configuration from file; a missing file yields defaults
    pub fn load(path: &Path) -> E2eResult<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Load from file, then apply process environment overrides
    pub fn load_with_env(path: &Path) -> E2eResult<Self> {
        let config = Self::load_layered(path, env_source())?;
        config.validate()?;
        Ok(config)
    }

    /// Layer `env` over the file (or defaults).
    ///
    /// Nested keys use `__`, e.g. `UIFLOW_BROWSER__WEBDRIVER__URL`. `vars`
    /// come from the file only; scenario inputs already fall back to the
    /// process environment.
    pub fn load_layered(path: &Path, env: ::config::Environment) -> E2eResult<Self> {
        let mut file = Self::load(path)?;
        let vars = std::mem::take(&mut file.vars);

        let mut config: Self = ::config::Config::builder()
            .add_source(::config::Config::try_from(&file)?)
            .add_source(env)
            .build()?
            .try_deserialize()?;
        config.vars = vars;
        Ok(config)
    }

    pub fn validate(&self) -> E2eResult<()> {
        url::Url::parse(&self.base_url)
            .map_err(|e| E2eError::InvalidConfig(format!("base_url '{}': {}", self.base_url, e)))?;
        if self.timing.poll_interval_ms == 0 {
            return Err(E2eError::InvalidConfig("poll_interval_ms must be > 0".into()));
        }
        if self.timing.settle_ms > 1_000 {
            return Err(E2eError::InvalidConfig("settle_ms must be at most 1000".into()));
        }
        if self.concurrency == 0 {
            return Err(E2eError::InvalidConfig("concurrency must be > 0".into()));
        }
        Ok(())
    }

    /// Resolve a scenario URL against `base_url`
    pub fn resolve_url(&self, url: &str) -> E2eResult<String> {
        let base = url::Url::parse(&self.base_url)
            .map_err(|e| E2eError::InvalidConfig(format!("base_url '{}': {}", self.base_url, e)))?;
        let joined = base
            .join(url)
            .map_err(|e| E2eError::ScenarioParse(format!("url '{}': {}", url, e)))?;
        Ok(joined.to_string())
    }
}

/// `UIFLOW_*` variables, numbers and booleans parsed, `browser.args` comma separated
pub fn env_source() -> ::config::Environment {
    ::config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("browser.args")
}
