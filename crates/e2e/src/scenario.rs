//! Declarative YAML scenarios

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::config::Viewport;
use crate::driver::LoadState;
use crate::error::{E2eError, E2eResult};
use crate::locator::{By, Locator, PageTarget};
use crate::wait::ElementCondition;

/// `${NAME}` input placeholder
static INPUT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern compiles"));

/// A complete UI flow parsed from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    /// Unique identifier, used in reports and `--id` filters
    #[serde(alias = "name")]
    pub id: String,

    #[serde(default)]
    pub description: String,

    /// Tags for filtering scenarios
    #[serde(default)]
    pub tags: Vec<String>,

    /// Viewport override for this scenario's browser
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport: Option<Viewport>,

    /// Override of the overall scenario budget
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,

    /// Steps to execute in order
    #[serde(default)]
    pub steps: Vec<Step>,

    /// Terminal assertion, run after the last step
    pub expect: Assertion,

    /// File the scenario was loaded from
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

/// A single step in a scenario
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    /// Navigate the current page (URL relative to base)
    Navigate {
        url: String,
        #[serde(default)]
        wait_until: LoadState,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },

    /// Clear an input and type a value
    Fill {
        locator: Locator,
        value: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
        #[serde(default)]
        page: Option<usize>,
    },

    /// Click an element
    Click {
        locator: Locator,
        #[serde(default)]
        settle_ms: Option<u64>,
        #[serde(default)]
        timeout_ms: Option<u64>,
        #[serde(default)]
        page: Option<usize>,
    },

    /// Scroll the page viewport
    Scroll {
        #[serde(default)]
        dx: i64,
        #[serde(default)]
        dy: i64,
        #[serde(default)]
        page: Option<usize>,
    },

    /// Wait for an element or page state
    WaitFor {
        #[serde(default)]
        locator: Option<Locator>,
        #[serde(default)]
        state: WaitState,
        #[serde(default)]
        timeout_ms: Option<u64>,
        #[serde(default)]
        page: Option<usize>,
    },

    /// Assert an element's visibility
    Assert(Assertion),

    /// Wait for a fixed amount of time (use sparingly)
    Sleep { ms: u64 },

    /// Log a message
    Log { message: String },
}

/// Visibility assertion, used both as a step and as the terminal `expect`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assertion {
    pub locator: Locator,

    #[serde(default = "default_visible")]
    pub visible: bool,

    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Author's failure message, reported verbatim
    #[serde(default)]
    pub message: Option<String>,

    #[serde(default)]
    pub page: Option<usize>,
}

fn default_visible() -> bool {
    true
}

/// States a `wait_for` step can target
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitState {
    #[default]
    Visible,
    Hidden,
    Attached,
    Detached,
    #[serde(rename = "domcontentloaded")]
    DomContentLoaded,
    Load,
}

impl WaitState {
    /// Element condition, or `None` for page load states
    pub fn element_condition(&self) -> Option<ElementCondition> {
        match self {
            WaitState::Visible => Some(ElementCondition::Visible),
            WaitState::Hidden => Some(ElementCondition::Hidden),
            WaitState::Attached => Some(ElementCondition::Attached),
            WaitState::Detached => Some(ElementCondition::Detached),
            WaitState::DomContentLoaded | WaitState::Load => None,
        }
    }

    pub fn load_state(&self) -> Option<LoadState> {
        match self {
            WaitState::DomContentLoaded => Some(LoadState::DomContentLoaded),
            WaitState::Load => Some(LoadState::Load),
            _ => None,
        }
    }
}

impl Step {
    /// Short action name for reports
    pub fn name(&self) -> &'static str {
        match self {
            Step::Navigate { .. } => "navigate",
            Step::Fill { .. } => "fill",
            Step::Click { .. } => "click",
            Step::Scroll { .. } => "scroll",
            Step::WaitFor { .. } => "wait_for",
            Step::Assert(_) => "assert",
            Step::Sleep { .. } => "sleep",
            Step::Log { .. } => "log",
        }
    }

    /// Page the step targets
    pub fn target(&self) -> PageTarget {
        match self {
            Step::Fill { page, .. } | Step::Click { page, .. } | Step::Scroll { page, .. } => (*page).into(),
            Step::WaitFor { page, .. } => (*page).into(),
            Step::Assert(a) => a.page.into(),
            Step::Navigate { .. } | Step::Sleep { .. } | Step::Log { .. } => PageTarget::Current,
        }
    }

    fn strings_mut(&mut self) -> Vec<&mut String> {
        match self {
            Step::Navigate { url, .. } => vec![url],
            Step::Fill { locator, value, .. } => {
                let mut out = locator_strings(locator);
                out.push(value);
                out
            }
            Step::Click { locator, .. } => locator_strings(locator),
            Step::WaitFor { locator, .. } => locator.as_mut().map(locator_strings).unwrap_or_default(),
            Step::Assert(a) => a.strings_mut(),
            Step::Log { message } => vec![message],
            Step::Scroll { .. } | Step::Sleep { .. } => Vec::new(),
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Navigate { url, .. } => write!(f, "navigate {}", url),
            Step::Fill { locator, .. } => write!(f, "fill {}", locator),
            Step::Click { locator, .. } => write!(f, "click {}", locator),
            Step::Scroll { dx, dy, .. } => write!(f, "scroll by ({}, {})", dx, dy),
            Step::WaitFor { locator: Some(l), state, .. } => write!(f, "wait_for {} {:?}", l, state),
            Step::WaitFor { state, .. } => write!(f, "wait_for page {:?}", state),
            Step::Assert(a) => write!(f, "assert {}", a),
            Step::Sleep { ms } => write!(f, "sleep {} ms", ms),
            Step::Log { message } => write!(f, "log {:?}", message),
        }
    }
}

impl Assertion {
    fn strings_mut(&mut self) -> Vec<&mut String> {
        let mut out = locator_strings(&mut self.locator);
        if let Some(message) = self.message.as_mut() {
            out.push(message);
        }
        out
    }
}

impl fmt::Display for Assertion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.visible { "visible" } else { "hidden" };
        write!(f, "{} is {}", self.locator, state)
    }
}

fn locator_strings(locator: &mut Locator) -> Vec<&mut String> {
    let mut out: Vec<&mut String> = match &mut locator.by {
        By::Role { role, name } => {
            let mut v = vec![role];
            if let Some(name) = name.as_mut() {
                v.push(name);
            }
            v
        }
        By::Text { text, .. } => vec![text],
        By::Path { xpath } => vec![xpath],
    };
    if let Some(frame) = locator.frame.as_mut() {
        out.push(frame);
    }
    out
}

impl Scenario {
    /// Parse a scenario from a YAML string
    pub fn from_yaml(yaml: &str) -> E2eResult<Self> {
        let scenario: Self = serde_yaml::from_str(yaml).map_err(E2eError::from)?;
        scenario.validate()?;
        Ok(scenario)
    }

    /// Parse a scenario from a YAML file
    pub fn from_file(path: &Path) -> E2eResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut scenario = Self::from_yaml(&content)
            .map_err(|e| E2eError::ScenarioParse(format!("{}: {}", path.display(), e)))?;
        scenario.source = Some(path.to_path_buf());
        Ok(scenario)
    }

    /// Load all scenarios below a directory, sorted by path
    pub fn load_all(dir: &Path) -> E2eResult<Vec<Self>> {
        Self::load_paths(&[dir.to_path_buf()])
    }

    /// Load from a mix of files and directories
    pub fn load_paths(paths: &[PathBuf]) -> E2eResult<Vec<Self>> {
        let scenarios = discover(paths)
            .iter()
            .map(|p| Self::from_file(p))
            .collect::<E2eResult<Vec<_>>>()?;
        check_unique(&scenarios)?;
        Ok(scenarios)
    }

    /// Filter scenarios by tag
    pub fn filter_by_tag<'a>(scenarios: &'a [Self], tag: &str) -> Vec<&'a Self> {
        scenarios.iter().filter(|s| s.tags.iter().any(|t| t == tag)).collect()
    }

    /// Structural checks serde can't express
    pub fn validate(&self) -> E2eResult<()> {
        let invalid = |msg: String| Err(E2eError::ScenarioParse(format!("scenario '{}': {}", self.id, msg)));

        if self.id.trim().is_empty() {
            return Err(E2eError::ScenarioParse("scenario id must not be empty".into()));
        }
        for (index, step) in self.steps.iter().enumerate() {
            match step {
                Step::WaitFor { locator: None, state, .. } if state.element_condition().is_some() => {
                    return invalid(format!("step {}: wait_for {:?} needs a locator", index, state));
                }
                Step::Navigate { url, .. } if url.trim().is_empty() => {
                    return invalid(format!("step {}: navigate needs a url", index));
                }
                _ => {}
            }
        }
        if let Some(0) = self.deadline_ms {
            return invalid("deadline_ms must be positive".into());
        }
        Ok(())
    }

    /// Number of executable steps, terminal assertion included
    pub fn step_count(&self) -> usize {
        self.steps.len() + 1
    }

    /// Substitute `${NAME}` placeholders from `vars`, then the environment
    pub fn resolve_inputs(&self, vars: &BTreeMap<String, String>) -> E2eResult<Self> {
        self.with_inputs(|name| vars.get(name).cloned().or_else(|| std::env::var(name).ok()))
    }

    /// Substitute `${NAME}` placeholders in URLs, values, locators and
    /// messages. An unknown name is an error.
    pub fn with_inputs<F>(&self, lookup: F) -> E2eResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut resolved = self.clone();
        let mut missing: Vec<String> = Vec::new();

        let fields = resolved
            .steps
            .iter_mut()
            .flat_map(Step::strings_mut)
            .chain(resolved.expect.strings_mut());
        for field in fields {
            if !field.contains("${") {
                continue;
            }
            let replaced = INPUT.replace_all(field, |caps: &Captures| match lookup(&caps[1]) {
                Some(value) => value,
                None => {
                    missing.push(caps[1].to_string());
                    String::new()
                }
            })
            .into_owned();
            *field = replaced;
        }

        if missing.is_empty() {
            Ok(resolved)
        } else {
            missing.sort();
            missing.dedup();
            Err(E2eError::ScenarioParse(format!(
                "scenario '{}': no value for input(s) {}",
                self.id,
                missing.join(", ")
            )))
        }
    }
}

/// Scenario files named by `paths`: files as given, directories walked
/// recursively for `*.yaml`/`*.yml` in sorted order
pub fn discover(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for path in paths {
        if !path.is_dir() {
            out.push(path.clone());
            continue;
        }
        let mut found: Vec<PathBuf> = walkdir::WalkDir::new(path)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() && is_scenario_file(e.path()))
            .map(|e| e.into_path())
            .collect();
        found.sort();
        out.extend(found);
    }
    out
}

fn is_scenario_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext == "yaml" || ext == "yml")
        .unwrap_or(false)
}

fn check_unique(scenarios: &[Scenario]) -> E2eResult<()> {
    let mut seen = HashSet::new();
    for s in scenarios {
        if !seen.insert(s.id.as_str()) {
            return Err(E2eError::ScenarioParse(format!("duplicate scenario id '{}'", s.id)));
        }
    }
    Ok(())
}
