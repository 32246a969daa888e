//! Scenario runs against the in-memory browser
//!
//! Time is paused, so every wait below resolves deterministically and the
//! multi-second timeouts cost nothing.

use std::sync::Arc;
use std::time::Duration;

use uiflow_e2e::driver::memory::{ClickEffect, MemoryBrowser, MemoryElement, MemoryFrame};
use uiflow_e2e::{ExecutionResult, RunnerConfig, Scenario, ScenarioRunner};

const LOGIN: &str = r#"
id: login-success
description: Sign in with valid credentials and land on the dashboard
tags: [auth, smoke]
steps:
  - action: navigate
    url: /login
  - action: fill
    locator: { role: textbox, name: Email }
    value: ${QA_EMAIL}
  - action: fill
    locator: { xpath: "html/body/div/form/input[2]" }
    value: ${QA_PASSWORD}
  - action: click
    locator: { role: button, name: Sign in }
expect:
  locator: { text: Dashboard }
  message: Login did not reach the dashboard
"#;

fn config() -> RunnerConfig {
    let mut config = RunnerConfig::default();
    config.vars.insert("QA_EMAIL".into(), "qa@example.com".into());
    config.vars.insert("QA_PASSWORD".into(), "correct-horse".into());
    config
}

fn login_page(email: MemoryElement) -> MemoryFrame {
    MemoryFrame::new()
        .element(email)
        .element(MemoryElement::new("password", "input").xpath("html/body/div/form/input[2]"))
        .element(
            MemoryElement::new("sign-in", "button")
                .text("Sign in")
                .on_click(ClickEffect::Navigate("http://localhost:3000/dashboard".into())),
        )
}

fn email() -> MemoryElement {
    MemoryElement::new("email", "input").label("Email")
}

fn site(email: MemoryElement, dashboard: MemoryFrame) -> MemoryBrowser {
    let browser = MemoryBrowser::new();
    browser.route("http://localhost:3000/login", login_page(email));
    browser.route("http://localhost:3000/dashboard", dashboard);
    browser
}

fn dashboard() -> MemoryFrame {
    MemoryFrame::new().element(MemoryElement::new("title", "h1").text("Dashboard"))
}

async fn run(browser: &MemoryBrowser, yaml: &str) -> uiflow_e2e::ScenarioReport {
    let scenario = Scenario::from_yaml(yaml).unwrap();
    let runner = ScenarioRunner::new(Arc::new(browser.clone()), config());
    runner.run(&scenario).await
}

fn assert_torn_down_once(browser: &MemoryBrowser) {
    let stats = browser.stats();
    assert_eq!(stats.contexts_opened, 1);
    assert_eq!(stats.contexts_closed, 1);
    assert_eq!(stats.browsers_closed, 1);
    assert_eq!(stats.running(), 0);
}

#[tokio::test(start_paused = true)]
async fn login_success_passes() {
    let browser = site(email(), dashboard());
    let report = run(&browser, LOGIN).await;

    assert_eq!(report.result, ExecutionResult::Passed, "{}", report.line());
    assert_eq!(report.steps.len(), 5);
    assert_eq!(report.steps[4].action, "expect");
    assert_eq!(
        browser.stats().fills,
        vec![
            ("email".to_string(), "qa@example.com".to_string()),
            ("password".to_string(), "correct-horse".to_string()),
        ]
    );
    assert_eq!(browser.stats().clicks, vec!["sign-in".to_string()]);
    assert_torn_down_once(&browser);
}

#[tokio::test(start_paused = true)]
async fn login_fails_at_terminal_assertion_when_marker_never_appears() {
    let browser = site(email(), MemoryFrame::new().element(MemoryElement::new("err", "p").text("Invalid credentials")));
    let report = run(&browser, LOGIN).await;

    match &report.result {
        ExecutionResult::Failed { reason, step } => {
            assert_eq!(*step, 4);
            assert!(reason.contains("Login did not reach the dashboard"), "{}", reason);
            assert!(reason.contains("observed no match"), "{}", reason);
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert!(report.line().starts_with("login-success failed [step 4] "));
    assert_torn_down_once(&browser);
}

#[tokio::test(start_paused = true)]
async fn stale_fill_is_retried_once() {
    let browser = site(email().stale_fills(1), dashboard());
    let report = run(&browser, LOGIN).await;

    assert!(report.result.is_passed(), "{}", report.line());
    assert_eq!(browser.stats().fills.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn stale_twice_fails_the_step() {
    let browser = site(email().stale_fills(2), dashboard());
    let report = run(&browser, LOGIN).await;

    match &report.result {
        ExecutionResult::Failed { reason, step } => {
            assert_eq!(*step, 1);
            assert!(reason.starts_with("Stale element"), "{}", reason);
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert!(report.steps[1].error.is_some());
    assert_torn_down_once(&browser);
}

#[tokio::test(start_paused = true)]
async fn deadline_exceeded_errors_and_tears_down() {
    let browser = site(email(), dashboard());
    let yaml = r#"
id: slow
deadline_ms: 10000
steps:
  - action: navigate
    url: /login
  - action: wait_for
    locator: { text: Never rendered }
    state: visible
    timeout_ms: 15000
expect:
  locator: { text: Dashboard }
"#;
    let start = tokio::time::Instant::now();
    let report = run(&browser, yaml).await;

    match &report.result {
        ExecutionResult::Errored { cause } => {
            assert!(cause.contains("budget of 10000 ms exhausted"), "{}", cause);
            assert!(cause.contains("during step 1"), "{}", cause);
        }
        other => panic!("expected errored, got {:?}", other),
    }
    // the in-flight 15 s wait was dropped at the deadline
    assert!(start.elapsed() < Duration::from_secs(11));
    assert_torn_down_once(&browser);
}

#[tokio::test(start_paused = true)]
async fn setup_failure_is_errored_not_failed() {
    let browser = site(email(), dashboard());
    browser.fail_connect();
    let report = run(&browser, LOGIN).await;

    assert!(matches!(report.result, ExecutionResult::Errored { .. }));
    assert!(report.steps.is_empty());
    assert_eq!(browser.stats().contexts_opened, 0);
}

#[tokio::test(start_paused = true)]
async fn missing_input_is_errored_before_any_session() {
    let browser = site(email(), dashboard());
    let scenario = Scenario::from_yaml(LOGIN).unwrap();
    let runner = ScenarioRunner::new(Arc::new(browser.clone()), RunnerConfig::default());

    let report = runner.run(&scenario).await;
    match &report.result {
        ExecutionResult::Errored { cause } => assert!(cause.contains("QA_EMAIL"), "{}", cause),
        other => panic!("expected errored, got {:?}", other),
    }
    assert_eq!(browser.stats().contexts_opened, 0);
}

#[tokio::test(start_paused = true)]
async fn delayed_render_is_awaited_not_slept() {
    let browser = MemoryBrowser::new();
    browser.route(
        "http://localhost:3000/inventory",
        MemoryFrame::new()
            .element(
                MemoryElement::new("adjust", "button")
                    .text("Adjust stock")
                    .attach_after(Duration::from_secs(2))
                    .on_click(ClickEffect::Reveal("saved".into())),
            )
            .element(MemoryElement::new("saved", "div").text("Inventory updated").revealed_by_click()),
    );
    let yaml = r#"
id: inventory-adjust
steps:
  - action: navigate
    url: /inventory
  - action: click
    locator: { role: button, name: Adjust stock }
expect:
  locator: { text: Inventory updated }
"#;
    let start = tokio::time::Instant::now();
    let report = run(&browser, yaml).await;

    assert!(report.result.is_passed(), "{}", report.line());
    // 2 s render + one stability poll + 500 ms settle
    assert!(start.elapsed() < Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn click_opening_a_page_retargets_later_steps() {
    let browser = MemoryBrowser::new();
    browser.route(
        "http://localhost:3000/tools",
        MemoryFrame::new().element(
            MemoryElement::new("open", "a")
                .text("Open report")
                .on_click(ClickEffect::OpenPage("http://localhost:3000/report".into())),
        ),
    );
    browser.route(
        "http://localhost:3000/report",
        MemoryFrame::new().element(MemoryElement::new("done", "h2").text("Export Successful!")),
    );
    let yaml = r#"
id: export
steps:
  - action: navigate
    url: /tools
  - action: click
    locator: { text: Open report, nth: 0 }
  - action: assert
    locator: { text: Open report }
    page: 0
expect:
  locator: { text: Export Successful! }
"#;
    let report = run(&browser, yaml).await;
    assert!(report.result.is_passed(), "{}", report.line());
}

#[tokio::test(start_paused = true)]
async fn element_in_named_frame_is_found() {
    let browser = MemoryBrowser::new();
    browser.route(
        "http://localhost:3000/checkout",
        MemoryFrame::new()
            .element(MemoryElement::new("outer-pay", "button").text("Pay"))
            .child(
                MemoryFrame::new()
                    .named("payments")
                    .element(
                        MemoryElement::new("inner-pay", "button")
                            .text("Pay")
                            .on_click(ClickEffect::Reveal("paid".into())),
                    )
                    .element(MemoryElement::new("paid", "p").text("Payment accepted").revealed_by_click()),
            )
            .child(MemoryFrame::new().named("ads").failing_load()),
    );
    let yaml = r#"
id: checkout
steps:
  - action: navigate
    url: /checkout
  - action: click
    locator: { role: button, name: Pay, frame: payments }
expect:
  locator: { text: Payment accepted, frame: payments }
"#;
    let report = run(&browser, yaml).await;

    assert!(report.result.is_passed(), "{}", report.line());
    assert_eq!(browser.stats().clicks, vec!["inner-pay".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn wait_for_hidden_after_dismiss() {
    let browser = MemoryBrowser::new();
    browser.route(
        "http://localhost:3000/",
        MemoryFrame::new()
            .element(
                MemoryElement::new("dismiss", "button")
                    .text("Dismiss")
                    .on_click(ClickEffect::Remove("banner".into())),
            )
            .element(MemoryElement::new("banner", "div").text("Welcome back")),
    );
    let yaml = r#"
id: dismiss-banner
steps:
  - action: navigate
    url: /
  - action: click
    locator: { role: button, name: Dismiss }
  - action: wait_for
    locator: { text: Welcome back }
    state: detached
  - action: scroll
    dy: 400
  - action: log
    message: banner gone
expect:
  locator: { text: Welcome back }
  visible: false
"#;
    let report = run(&browser, yaml).await;

    assert!(report.result.is_passed(), "{}", report.line());
    assert_eq!(browser.stats().scrolls, vec![(0, 400)]);
}

#[tokio::test(start_paused = true)]
async fn suite_runs_concurrently_and_keeps_order() {
    let browser = site(email(), dashboard());
    let scenarios: Vec<Scenario> = ["a", "b", "c"]
        .iter()
        .map(|id| Scenario::from_yaml(&LOGIN.replace("id: login-success", &format!("id: {}", id))).unwrap())
        .collect();

    let mut config = config();
    config.concurrency = 2;
    let runner = ScenarioRunner::new(Arc::new(browser.clone()), config);
    let suite = runner.run_suite(&scenarios).await;

    let ids: Vec<&str> = suite.reports.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
    assert!(suite.all_passed());

    let stats = browser.stats();
    assert_eq!(stats.contexts_opened, 3);
    assert_eq!(stats.contexts_closed, 3);
    assert_eq!(stats.running(), 0);
}

#[test]
fn bundled_scenarios_parse() {
    let dir = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../scenarios");
    let scenarios = Scenario::load_all(&dir).unwrap();
    let ids: Vec<&str> = scenarios.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, vec!["export-functions", "user-authentication-success"]);
    assert_eq!(Scenario::filter_by_tag(&scenarios, "smoke").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn wait_for_visible_with_two_matches_fails_the_step() {
    let browser = MemoryBrowser::new();
    browser.route(
        "http://localhost:3000/checkout",
        MemoryFrame::new()
            .element(MemoryElement::new("pay-top", "button").text("Pay"))
            .element(MemoryElement::new("pay-bottom", "button").text("Pay")),
    );
    let yaml = r#"
id: ambiguous-pay
steps:
  - action: navigate
    url: /checkout
  - action: wait_for
    locator: { text: Pay }
    state: visible
    timeout_ms: 1000
expect:
  locator: { text: Pay, nth: 0 }
"#;
    let report = run(&browser, yaml).await;

    match &report.result {
        ExecutionResult::Failed { reason, step } => {
            assert_eq!(*step, 1);
            assert!(reason.contains("2 matches, expected exactly one"), "{}", reason);
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert_torn_down_once(&browser);
}
