//! Run Command

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Args;
use serde::Serialize;
use tracing::info;
use uiflow_e2e::{BrowserKind, ExecutionResult, RunnerConfig, Scenario, ScenarioReport, ScenarioRunner, Viewport, WebDriverLauncher};

use super::{load_config, scenario_paths, EXIT_FAILED, EXIT_PASSED};
use crate::output::{outcome_label, print_error, print_list, print_success, OutputFormat, TableDisplay};

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Scenario files or directories (default: scenarios_dir from config)
    pub paths: Vec<PathBuf>,

    /// Only run scenarios with this tag
    #[arg(short, long)]
    pub tag: Option<String>,

    /// Only run scenarios with these ids
    #[arg(long)]
    pub id: Vec<String>,

    /// Base URL of the application under test
    #[arg(long)]
    pub base_url: Option<String>,

    /// Browser to drive (chrome, firefox)
    #[arg(long)]
    pub browser: Option<BrowserKind>,

    /// Show the browser window
    #[arg(long)]
    pub headed: bool,

    /// Viewport as WIDTHxHEIGHT
    #[arg(long)]
    pub viewport: Option<Viewport>,

    /// Use an already running WebDriver server instead of spawning one
    #[arg(long)]
    pub webdriver_url: Option<String>,

    /// Scenarios to run at once
    #[arg(short = 'j', long)]
    pub concurrency: Option<usize>,

    /// Directory for results.json
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Scenario input as NAME=VALUE (repeatable)
    #[arg(long = "var", value_parser = parse_var)]
    pub vars: Vec<(String, String)>,
}

impl RunArgs {
    /// Flags win over file and environment
    pub fn apply(&self, config: &mut RunnerConfig) {
        if let Some(url) = &self.base_url {
            config.base_url = url.clone();
        }
        if let Some(kind) = self.browser {
            config.browser.kind = kind;
        }
        if self.headed {
            config.browser.headless = false;
        }
        if let Some(viewport) = self.viewport {
            config.browser.viewport = viewport;
        }
        if let Some(url) = &self.webdriver_url {
            config.browser.webdriver.url = Some(url.clone());
        }
        if let Some(n) = self.concurrency {
            config.concurrency = n;
        }
        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }
        for (name, value) in &self.vars {
            config.vars.insert(name.clone(), value.clone());
        }
    }

    /// Apply `--tag` and `--id` filters
    pub fn select(&self, scenarios: Vec<Scenario>) -> Vec<Scenario> {
        scenarios
            .into_iter()
            .filter(|s| self.tag.as_ref().map_or(true, |t| s.tags.contains(t)))
            .filter(|s| self.id.is_empty() || self.id.contains(&s.id))
            .collect()
    }
}

fn parse_var(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => Ok((name.trim().to_string(), value.to_string())),
        _ => Err(format!("expected NAME=VALUE, got '{}'", s)),
    }
}

/// Report display wrapper for serialization
#[derive(Serialize)]
pub struct ReportRow<'a>(&'a ScenarioReport);

impl TableDisplay for ReportRow<'_> {
    fn headers() -> Vec<&'static str> {
        vec!["Scenario", "Outcome", "Step", "Duration", "Message"]
    }

    fn row(&self) -> Vec<String> {
        let report = self.0;
        let (step, message) = match &report.result {
            ExecutionResult::Passed => ("-".to_string(), String::new()),
            ExecutionResult::Failed { reason, step } => (step.to_string(), reason.clone()),
            ExecutionResult::Errored { cause } => ("-".to_string(), cause.clone()),
        };
        vec![
            report.id.clone(),
            outcome_label(report.result.label()),
            step,
            format!("{} ms", report.duration_ms),
            message,
        ]
    }

    fn line(&self) -> String {
        self.0.line()
    }
}

pub async fn execute(args: RunArgs, config_path: &std::path::Path, format: OutputFormat) -> Result<u8> {
    let mut config = load_config(config_path)?;
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    let paths = scenario_paths(&args.paths, &config);
    let scenarios = args.select(Scenario::load_paths(&paths).context("Failed to load scenarios")?);
    if scenarios.is_empty() {
        bail!("No scenarios matched in {}", display_paths(&paths));
    }

    let output_dir = config.output_dir.clone();
    let runner = ScenarioRunner::new(Arc::new(WebDriverLauncher), config);
    let suite = runner.run_suite(&scenarios).await;

    let rows: Vec<ReportRow> = suite.reports.iter().map(ReportRow).collect();
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&suite)?),
        OutputFormat::Yaml => println!("{}", serde_yaml::to_string(&suite)?),
        _ => print_list(&rows, format),
    }

    match suite.write_results(&output_dir) {
        Ok(path) => info!("Wrote {}", path.display()),
        Err(e) => print_error(&format!("Could not write results: {}", e)),
    }

    if suite.all_passed() {
        print_success(&format!("{} scenario(s) passed", suite.passed));
        Ok(EXIT_PASSED)
    } else {
        print_error(&format!(
            "{} passed, {} failed, {} errored",
            suite.passed, suite.failed, suite.errored
        ));
        Ok(EXIT_FAILED)
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
