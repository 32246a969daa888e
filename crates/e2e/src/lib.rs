//! uiflow scenario runner
//!
//! Executes declarative UI flows against a web application through a browser
//! driver. Every synchronization point polls a predicate against a deadline,
//! and every element reference is re-resolved against the live DOM.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ScenarioRunner                         │
//! │    run_suite(scenarios) -> SuiteReport                      │
//! │    run(scenario) -> ScenarioReport                          │
//! │      Init ──> Running ──> Passed | Failed | Errored         │
//! │                  └──────────> TornDown (always)             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Session          acquire / release, pages, frames          │
//! │  action           fill, click, navigate, scroll             │
//! │  wait             Poller, load / visible / actionable /     │
//! │                   assertion / element-state waits           │
//! │  locator          role | text | xpath  ->  handles          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  driver::BrowserDriver + Launcher                           │
//! │    webdriver  fantoccini against chromedriver/geckodriver   │
//! │    memory     scripted in-process DOM                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod action;
pub mod config;
pub mod driver;
pub mod error;
pub mod locator;
pub mod runner;
pub mod scenario;
pub mod session;
pub mod wait;

pub use crate::config::{BrowserConfig, BrowserKind, RunnerConfig, Timing, Viewport};
pub use driver::memory::MemoryBrowser;
pub use driver::webdriver::WebDriverLauncher;
pub use driver::{BrowserDriver, Launcher};
pub use error::{E2eError, E2eResult};
pub use locator::{By, Locator, PageTarget};
pub use runner::{ExecutionResult, ScenarioReport, ScenarioRunner, StepRecord, SuiteReport};
pub use scenario::{Assertion, Scenario, Step, WaitState};
pub use session::Session;
