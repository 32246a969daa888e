//! Scenario runner: one session per scenario, steps in order, teardown always

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::action;
use crate::config::RunnerConfig;
use crate::driver::{Launcher, LoadState};
use crate::error::{E2eError, E2eResult};
use crate::scenario::{Scenario, Step};
use crate::session::Session;
use crate::wait::{wait_for_assertion, wait_for_element, wait_for_load, WaitSpec};

/// Outcome of one scenario run. Exactly one per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionResult {
    Passed,
    /// A step failed; `step` is its zero-based index
    Failed { reason: String, step: usize },
    /// The scenario could not be tested
    Errored { cause: String },
}

impl ExecutionResult {
    pub fn is_passed(&self) -> bool {
        matches!(self, ExecutionResult::Passed)
    }

    pub fn label(&self) -> &'static str {
        match self {
            ExecutionResult::Passed => "passed",
            ExecutionResult::Failed { .. } => "failed",
            ExecutionResult::Errored { .. } => "errored",
        }
    }
}

/// Timing and error of one executed step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub index: usize,
    pub action: String,
    pub description: String,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of running a single scenario
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub id: String,
    pub description: String,
    #[serde(flatten)]
    pub result: ExecutionResult,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub steps: Vec<StepRecord>,
}

impl ScenarioReport {
    /// `{id} {outcome} [step N] {message}`
    pub fn line(&self) -> String {
        match &self.result {
            ExecutionResult::Passed => format!("{} passed", self.id),
            ExecutionResult::Failed { reason, step } => format!("{} failed [step {}] {}", self.id, step, reason),
            ExecutionResult::Errored { cause } => format!("{} errored {}", self.id, cause),
        }
    }
}

/// Result of running a set of scenarios
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteReport {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub reports: Vec<ScenarioReport>,
}

impl SuiteReport {
    pub fn new(reports: Vec<ScenarioReport>, started_at: DateTime<Utc>, duration: Duration) -> Self {
        let count = |label: &str| reports.iter().filter(|r| r.result.label() == label).count();
        Self {
            total: reports.len(),
            passed: count("passed"),
            failed: count("failed"),
            errored: count("errored"),
            started_at,
            duration_ms: duration.as_millis() as u64,
            reports,
        }
    }

    pub fn all_passed(&self) -> bool {
        self.passed == self.total
    }

    /// Write results as pretty JSON to `<dir>/results.json`
    pub fn write_results(&self, dir: &Path) -> E2eResult<PathBuf> {
        std::fs::create_dir_all(dir)?;

        let path = dir.join("results.json");
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json)?;

        info!("Results written to: {}", path.display());
        Ok(path)
    }
}

/// Runs scenarios against browsers from a [`Launcher`]
pub struct ScenarioRunner {
    launcher: Arc<dyn Launcher>,
    config: RunnerConfig,
}

impl ScenarioRunner {
    pub fn new(launcher: Arc<dyn Launcher>, config: RunnerConfig) -> Self {
        Self { launcher, config }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Run scenarios with bounded concurrency. Reports come back in input order.
    pub async fn run_suite(&self, scenarios: &[Scenario]) -> SuiteReport {
        let started_at = Utc::now();
        let start = Instant::now();
        let concurrency = self.config.concurrency.max(1);

        info!("Running {} scenario(s), {} at a time...", scenarios.len(), concurrency);

        let reports: Vec<ScenarioReport> = stream::iter(scenarios)
            .map(|scenario| self.run(scenario))
            .buffered(concurrency)
            .collect()
            .await;

        let suite = SuiteReport::new(reports, started_at, start.elapsed());
        info!(
            "Scenario results: {} passed, {} failed, {} errored ({} ms)",
            suite.passed, suite.failed, suite.errored, suite.duration_ms
        );
        suite
    }

    /// Run one scenario. Never fails: every problem ends up in the report.
    pub async fn run(&self, scenario: &Scenario) -> ScenarioReport {
        let started_at = Utc::now();
        let start = Instant::now();
        let mut steps = Vec::new();

        let result = match scenario.resolve_inputs(&self.config.vars) {
            Ok(resolved) => self.execute(&resolved, &mut steps).await,
            Err(e) => ExecutionResult::Errored { cause: e.to_string() },
        };

        let report = ScenarioReport {
            id: scenario.id.clone(),
            description: scenario.description.clone(),
            result,
            started_at,
            duration_ms: start.elapsed().as_millis() as u64,
            steps,
        };

        match &report.result {
            ExecutionResult::Passed => info!("✓ {} ({} ms)", report.id, report.duration_ms),
            ExecutionResult::Failed { reason, step } => error!("✗ {} - step {}: {}", report.id, step, reason),
            ExecutionResult::Errored { cause } => error!("✗ {} - errored: {}", report.id, cause),
        }
        report
    }

    /// Init, Running, then TornDown on every path
    async fn execute(&self, scenario: &Scenario, records: &mut Vec<StepRecord>) -> ExecutionResult {
        let mut browser = self.config.browser.clone();
        if let Some(viewport) = scenario.viewport {
            browser.viewport = viewport;
        }

        debug!(scenario = %scenario.id, "init");
        let mut session = match Session::acquire(self.launcher.as_ref(), &browser).await {
            Ok(session) => session,
            Err(e) => return ExecutionResult::Errored { cause: e.to_string() },
        };

        let budget = scenario
            .deadline_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.timing.scenario_deadline());

        debug!(scenario = %scenario.id, session = %session.id(), "running");
        let running = AssertUnwindSafe(self.run_steps(&mut session, scenario, records)).catch_unwind();
        let outcome = timeout(budget, running).await;

        session.release().await;
        debug!(scenario = %scenario.id, "torn down");

        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => ExecutionResult::Errored {
                cause: format!("step {} panicked: {}", records.len(), panic_message(panic.as_ref())),
            },
            Err(_) => {
                let err = E2eError::BudgetExhausted {
                    budget_ms: budget.as_millis() as u64,
                };
                warn!(scenario = %scenario.id, "{} during step {}", err, records.len());
                ExecutionResult::Errored {
                    cause: format!("{} during step {}", err, records.len()),
                }
            }
        }
    }

    async fn run_steps(
        &self,
        session: &mut Session,
        scenario: &Scenario,
        records: &mut Vec<StepRecord>,
    ) -> ExecutionResult {
        let terminal = Step::Assert(scenario.expect.clone());
        let total = scenario.step_count();

        for (index, step) in scenario.steps.iter().chain(std::iter::once(&terminal)).enumerate() {
            let action = if index == scenario.steps.len() { "expect" } else { step.name() };
            debug!(scenario = %scenario.id, "Step {}/{}: {}", index + 1, total, step);

            let start = Instant::now();
            let outcome = self.execute_step(session, &scenario.id, step).await;
            records.push(StepRecord {
                index,
                action: action.to_string(),
                description: step.to_string(),
                duration_ms: start.elapsed().as_millis() as u64,
                error: outcome.as_ref().err().map(ToString::to_string),
            });

            if let Err(e) = outcome {
                return if e.is_environmental() {
                    ExecutionResult::Errored { cause: e.to_string() }
                } else {
                    ExecutionResult::Failed {
                        reason: e.to_string(),
                        step: index,
                    }
                };
            }
        }
        ExecutionResult::Passed
    }

    async fn execute_step(&self, session: &mut Session, scenario_id: &str, step: &Step) -> E2eResult<()> {
        let timing = &self.config.timing;
        let poll = timing.poll_interval();
        let within = |ms: Option<u64>, default: Duration| ms.map(Duration::from_millis).unwrap_or(default);
        let action_wait = |ms: Option<u64>| WaitSpec::new(within(ms, timing.action_timeout()), poll);
        let load_wait = WaitSpec::new(timing.load_timeout(), poll);
        let target = step.target();

        match step {
            Step::Navigate {
                url,
                wait_until,
                timeout_ms,
            } => {
                let url = self.config.resolve_url(url)?;
                let limit = within(*timeout_ms, timing.navigation_timeout());
                action::navigate(session, &url, *wait_until, limit, load_wait).await
            }
            Step::Fill {
                locator,
                value,
                timeout_ms,
                ..
            } => action::fill(session, locator, value, target, action_wait(*timeout_ms)).await,
            Step::Click {
                locator,
                settle_ms,
                timeout_ms,
                ..
            } => {
                let settle = within(*settle_ms, timing.settle());
                action::click(session, locator, target, action_wait(*timeout_ms), settle, load_wait).await
            }
            Step::Scroll { dx, dy, .. } => action::scroll(session, target, *dx, *dy).await,
            Step::WaitFor {
                locator,
                state,
                timeout_ms,
                ..
            } => match (state.element_condition(), locator) {
                (Some(condition), Some(locator)) => {
                    wait_for_element(session, locator, condition, target, action_wait(*timeout_ms)).await
                }
                (Some(_), None) => Err(E2eError::ScenarioParse(format!(
                    "wait_for {:?} needs a locator",
                    state
                ))),
                (None, _) => {
                    let page = session.page(target)?;
                    let load_state = state.load_state().unwrap_or(LoadState::DomContentLoaded);
                    let wait = WaitSpec::new(within(*timeout_ms, timing.load_timeout()), poll);
                    wait_for_load(session, &page, load_state, wait).await;
                    Ok(())
                }
            },
            Step::Assert(assertion) => {
                wait_for_assertion(
                    session,
                    &assertion.locator,
                    assertion.visible,
                    assertion.message.as_deref(),
                    target,
                    action_wait(assertion.timeout_ms),
                )
                .await
            }
            Step::Sleep { ms } => {
                debug!(scenario = %scenario_id, "Sleeping {} ms", ms);
                sleep(Duration::from_millis(*ms)).await;
                Ok(())
            }
            Step::Log { message } => {
                info!(scenario = %scenario_id, "{}", message);
                Ok(())
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
