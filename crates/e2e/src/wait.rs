//! Wait/retry engine
//!
//! Every synchronization point polls a predicate against a deadline instead of
//! sleeping for a fixed time. [`Poller`] is the primitive; the functions below
//! build the document-ready, element-visible, action-ready, assertion and
//! element-state waits on top of it.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::driver::{ElementHandle, ElementState, LoadState, PageId, Rect};
use crate::error::{E2eError, E2eResult};
use crate::locator::{resolve, Locator, PageTarget};
use crate::session::Session;

/// Deadline passed without the condition holding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedOut {
    pub elapsed: Duration,
    pub attempts: u32,
}

/// Fixed-interval poll schedule bounded by a deadline
#[derive(Debug)]
pub struct Poller {
    started: Instant,
    deadline: Instant,
    interval: Duration,
    attempts: u32,
}

impl Poller {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        let started = Instant::now();
        Self {
            started,
            deadline: started + timeout,
            interval,
            attempts: 1,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Call after a failed check. Sleeps until the next poll, never past the
    /// deadline, or reports that the deadline has passed.
    pub async fn tick(&mut self) -> Result<(), TimedOut> {
        let now = Instant::now();
        if now >= self.deadline {
            return Err(TimedOut {
                elapsed: self.elapsed(),
                attempts: self.attempts,
            });
        }
        sleep(self.interval.min(self.deadline - now)).await;
        self.attempts += 1;
        Ok(())
    }
}

/// Poll `predicate` until it returns true or `timeout` elapses.
/// Returns the time waited.
pub async fn await_condition<F, Fut>(
    mut predicate: F,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<Duration, TimedOut>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let mut poller = Poller::new(timeout, poll_interval);
    loop {
        if predicate().await {
            return Ok(poller.elapsed());
        }
        poller.tick().await?;
    }
}

/// Timeout and interval for one wait
#[derive(Debug, Clone, Copy)]
pub struct WaitSpec {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl WaitSpec {
    pub fn new(timeout: Duration, poll_interval: Duration) -> Self {
        Self { timeout, poll_interval }
    }

    fn poller(&self) -> Poller {
        Poller::new(self.timeout, self.poll_interval)
    }
}

/// What one look at a locator found
#[derive(Debug, Clone)]
enum Seen {
    Missing,
    Ambiguous(usize),
    Found(ElementHandle, ElementState),
    /// The DOM could not be read this time round
    Unreadable(String),
}

impl Seen {
    fn describe(&self) -> String {
        match self {
            Seen::Missing => "no match".to_string(),
            Seen::Ambiguous(n) => format!("{} matches, expected exactly one", n),
            Seen::Found(_, state) => state.describe(),
            Seen::Unreadable(reason) => reason.clone(),
        }
    }
}

async fn observe(session: &mut Session, locator: &Locator, target: PageTarget) -> E2eResult<Seen> {
    match observe_once(session, locator, target).await {
        Err(e) if e.is_transient() => {
            debug!("Observing {} failed, polling again: {}", locator, e);
            Ok(Seen::Unreadable(e.to_string()))
        }
        other => other,
    }
}

async fn observe_once(session: &mut Session, locator: &Locator, target: PageTarget) -> E2eResult<Seen> {
    let mut found = resolve(session, locator, target).await?;
    match found.len() {
        0 => Ok(Seen::Missing),
        1 => {
            let handle = found.remove(0);
            let state = session.driver()?.inspect(&handle).await?;
            Ok(Seen::Found(handle, state))
        }
        n => Ok(Seen::Ambiguous(n)),
    }
}

/// Best-effort wait for every frame of `page` to reach `target`.
///
/// Frames whose check errors count as loaded, and running out of time is
/// logged, not raised. Returns whether everything settled in time.
pub async fn wait_for_load(session: &mut Session, page: &PageId, target: LoadState, wait: WaitSpec) -> bool {
    let mut poller = wait.poller();
    loop {
        match frames_loaded(session, page, target).await {
            Ok(true) => return true,
            Ok(false) => {}
            Err(e) => {
                debug!("Load-state check for page {} failed, treating as loaded: {}", page, e);
                return true;
            }
        }
        if let Err(t) = poller.tick().await {
            warn!(
                "Page {} did not reach '{}' within {} ms; continuing",
                page,
                target,
                t.elapsed.as_millis()
            );
            return false;
        }
    }
}

async fn frames_loaded(session: &mut Session, page: &PageId, target: LoadState) -> E2eResult<bool> {
    let frames = session.frames(page).await?;
    let driver = session.driver()?;
    for info in frames {
        match driver.load_state(page, &info.frame).await {
            Ok(state) if state >= target => {}
            Ok(_) => return Ok(false),
            Err(e) => debug!("Ignoring load error in frame {}: {}", info.frame, e),
        }
    }
    Ok(true)
}

/// Wait until the locator resolves to exactly one visible element
pub async fn wait_for_visible(
    session: &mut Session,
    locator: &Locator,
    target: PageTarget,
    wait: WaitSpec,
) -> E2eResult<ElementHandle> {
    let mut poller = wait.poller();
    loop {
        let seen = observe(session, locator, target).await?;
        if let Seen::Found(handle, state) = &seen {
            if state.is_visible() {
                return Ok(handle.clone());
            }
        }
        if poller.tick().await.is_err() {
            return Err(E2eError::NotFound {
                locator: locator.to_string(),
                observed: format!("{} after {} ms", seen.describe(), poller.elapsed().as_millis()),
            });
        }
    }
}

/// Wait until the element is visible, enabled and holds still for two polls
pub async fn wait_for_actionable(
    session: &mut Session,
    locator: &Locator,
    target: PageTarget,
    wait: WaitSpec,
) -> E2eResult<ElementHandle> {
    let mut poller = wait.poller();
    let mut previous: Option<(ElementHandle, Rect)> = None;
    loop {
        let seen = observe(session, locator, target).await?;
        let mut observed = seen.describe();

        if let Seen::Found(handle, state) = &seen {
            if state.is_visible() && state.enabled {
                let stable = matches!(&previous, Some((h, r)) if h == handle && *r == state.rect);
                if stable {
                    return Ok(handle.clone());
                }
                observed = "position not yet stable".to_string();
                previous = Some((handle.clone(), state.rect));
            } else {
                previous = None;
            }
        } else {
            previous = None;
        }

        if poller.tick().await.is_err() {
            let observed = format!("{} after {} ms", observed, poller.elapsed().as_millis());
            return Err(match seen {
                Seen::Missing | Seen::Unreadable(_) => E2eError::NotFound {
                    locator: locator.to_string(),
                    observed,
                },
                _ => E2eError::ElementNotInteractable {
                    locator: locator.to_string(),
                    observed,
                },
            });
        }
    }
}

/// Wait until the locator's visibility matches `visible`
pub async fn wait_for_assertion(
    session: &mut Session,
    locator: &Locator,
    visible: bool,
    message: Option<&str>,
    target: PageTarget,
    wait: WaitSpec,
) -> E2eResult<()> {
    let mut poller = wait.poller();
    loop {
        let (holds, observed) = visibility(session, locator, target).await?;
        if holds == Some(visible) {
            return Ok(());
        }
        if poller.tick().await.is_err() {
            return Err(E2eError::AssertionFailed {
                message: message.map(String::from),
                expected: format!(
                    "{} to be {}",
                    locator,
                    if visible { "visible" } else { "hidden" }
                ),
                observed: format!("{} after {} ms", observed, poller.elapsed().as_millis()),
            });
        }
    }
}

/// Whether any selected match is visible, plus what was seen.
/// `None` when the DOM could not be read.
async fn visibility(
    session: &mut Session,
    locator: &Locator,
    target: PageTarget,
) -> E2eResult<(Option<bool>, String)> {
    match any_visible(session, locator, target).await {
        Err(e) if e.is_transient() => {
            debug!("Visibility check of {} failed, polling again: {}", locator, e);
            Ok((None, e.to_string()))
        }
        Err(e) => Err(e),
        Ok((visible, observed)) => Ok((Some(visible), observed)),
    }
}

async fn any_visible(session: &mut Session, locator: &Locator, target: PageTarget) -> E2eResult<(bool, String)> {
    let found = resolve(session, locator, target).await?;
    if found.is_empty() {
        return Ok((false, "no match".to_string()));
    }
    let driver = session.driver()?;
    let mut last = String::new();
    for handle in &found {
        let state = driver.inspect(handle).await?;
        if state.is_visible() {
            return Ok((true, format!("{} match(es), one visible", found.len())));
        }
        last = state.describe();
    }
    Ok((false, format!("{} match(es), none visible ({})", found.len(), last)))
}

/// Element states a `wait_for` step can target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementCondition {
    Visible,
    Hidden,
    Attached,
    Detached,
}

/// Wait for an element condition.
///
/// `Visible` is the element-visible wait and fails with `NotFound`; the
/// other conditions time out with `TimedOut`.
pub async fn wait_for_element(
    session: &mut Session,
    locator: &Locator,
    condition: ElementCondition,
    target: PageTarget,
    wait: WaitSpec,
) -> E2eResult<()> {
    if condition == ElementCondition::Visible {
        return wait_for_visible(session, locator, target, wait).await.map(|_| ());
    }

    let mut poller = wait.poller();
    loop {
        let holds = match condition {
            ElementCondition::Hidden => visibility(session, locator, target).await?.0 == Some(false),
            ElementCondition::Attached => matches!(match_count(session, locator, target).await?, Some(n) if n > 0),
            ElementCondition::Detached => match_count(session, locator, target).await? == Some(0),
            ElementCondition::Visible => false,
        };
        if holds {
            return Ok(());
        }
        if let Err(t) = poller.tick().await {
            return Err(E2eError::TimedOut {
                what: format!("{} to be {}", locator, format!("{:?}", condition).to_lowercase()),
                waited_ms: t.elapsed.as_millis() as u64,
            });
        }
    }
}

async fn match_count(session: &mut Session, locator: &Locator, target: PageTarget) -> E2eResult<Option<usize>> {
    match resolve(session, locator, target).await {
        Ok(found) => Ok(Some(found.len())),
        Err(e) if e.is_transient() => {
            debug!("Resolving {} failed, polling again: {}", locator, e);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_true_at_time_zero_does_not_sleep() {
        let start = Instant::now();
        let waited = await_condition(|| async { true }, Duration::from_secs(5), Duration::from_millis(250))
            .await
            .unwrap();
        assert_eq!(waited, Duration::ZERO);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_true_times_out_within_one_interval_of_deadline() {
        let timeout = Duration::from_millis(1_000);
        let interval = Duration::from_millis(300);
        let start = Instant::now();

        let err = await_condition(|| async { false }, timeout, interval).await.unwrap_err();

        let elapsed = start.elapsed();
        assert!(elapsed >= timeout, "returned early: {:?}", elapsed);
        assert!(elapsed <= timeout + interval, "returned late: {:?}", elapsed);
        // 0, 300, 600, 900, 1000
        assert_eq!(err.attempts, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_becomes_true_on_later_poll() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let waited = await_condition(
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move { n >= 3 }
            },
            Duration::from_secs(5),
            Duration::from_millis(100),
        )
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(waited, Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_timeout_checks_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = await_condition(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { false }
            },
            Duration::ZERO,
            Duration::from_millis(100),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    use crate::config::BrowserConfig;
    use crate::driver::memory::{MemoryBrowser, MemoryElement, MemoryFrame};

    const URL: &str = "http://app/checkout";

    fn waits(timeout_ms: u64) -> WaitSpec {
        WaitSpec::new(Duration::from_millis(timeout_ms), Duration::from_millis(100))
    }

    async fn session_with(frame: MemoryFrame) -> (MemoryBrowser, Session) {
        let browser = MemoryBrowser::new();
        browser.route(URL, frame);
        let mut session = Session::acquire(&browser, &BrowserConfig::default()).await.unwrap();
        let page = session.current_page().unwrap();
        session.driver().unwrap().navigate(&page, URL).await.unwrap();
        (browser, session)
    }

    #[tokio::test(start_paused = true)]
    async fn test_visible_wait_rejects_two_matches() {
        let (_browser, mut session) = session_with(
            MemoryFrame::new()
                .element(MemoryElement::new("pay-top", "button").text("Pay"))
                .element(MemoryElement::new("pay-bottom", "button").text("Pay")),
        )
        .await;

        let pay = Locator::text("Pay");
        let err = wait_for_element(&mut session, &pay, ElementCondition::Visible, PageTarget::Current, waits(1_000))
            .await
            .unwrap_err();
        match err {
            E2eError::NotFound { observed, .. } => assert!(observed.contains("2 matches"), "{}", observed),
            other => panic!("unexpected error: {}", other),
        }

        wait_for_element(
            &mut session,
            &pay.clone().nth(1),
            ElementCondition::Visible,
            PageTarget::Current,
            waits(1_000),
        )
        .await
        .unwrap();
        session.release().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_actionable_waits_for_box_to_stop_moving() {
        let (_browser, mut session) =
            session_with(MemoryFrame::new().element(MemoryElement::new("pay", "button").text("Pay").unsettled_polls(3)))
                .await;

        let start = Instant::now();
        wait_for_actionable(&mut session, &Locator::text("Pay"), PageTarget::Current, waits(5_000))
            .await
            .unwrap();

        // moves on polls 0..=2, first identical box on poll 3
        assert_eq!(start.elapsed(), Duration::from_millis(300));
        session.release().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_actionable_timeout_on_covered_element() {
        let (_browser, mut session) =
            session_with(MemoryFrame::new().element(MemoryElement::new("pay", "button").text("Pay").covered())).await;

        let err = wait_for_actionable(&mut session, &Locator::text("Pay"), PageTarget::Current, waits(500))
            .await
            .unwrap_err();
        match err {
            E2eError::ElementNotInteractable { observed, .. } => {
                assert!(observed.contains("covered by another element"), "{}", observed)
            }
            other => panic!("unexpected error: {}", other),
        }
        session.release().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_actionable_timeout_on_disabled_element() {
        let (_browser, mut session) =
            session_with(MemoryFrame::new().element(MemoryElement::new("pay", "button").text("Pay").disabled())).await;

        let err = wait_for_actionable(&mut session, &Locator::text("Pay"), PageTarget::Current, waits(500))
            .await
            .unwrap_err();
        match err {
            E2eError::ElementNotInteractable { observed, .. } => assert!(observed.starts_with("disabled"), "{}", observed),
            other => panic!("unexpected error: {}", other),
        }
        session.release().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_actionable_timeout_without_match_is_not_found() {
        let (_browser, mut session) = session_with(MemoryFrame::new()).await;

        let start = Instant::now();
        let err = wait_for_actionable(&mut session, &Locator::text("Pay"), PageTarget::Current, waits(500))
            .await
            .unwrap_err();

        assert!(matches!(err, E2eError::NotFound { .. }), "{}", err);
        assert!(start.elapsed() <= Duration::from_millis(600));
        session.release().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_actionable_keeps_polling_through_frame_errors() {
        let (browser, mut session) =
            session_with(MemoryFrame::new().element(MemoryElement::new("pay", "button").text("Pay"))).await;
        browser.flaky_frames(2);

        let start = Instant::now();
        wait_for_actionable(&mut session, &Locator::text("Pay"), PageTarget::Current, waits(5_000))
            .await
            .unwrap();

        // two unreadable polls, then two to confirm the box
        assert_eq!(start.elapsed(), Duration::from_millis(300));
        session.release().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_hidden_and_detached_conditions() {
        let (browser, mut session) = session_with(
            MemoryFrame::new()
                .element(MemoryElement::new("spinner", "div").text("Loading").invisible())
                .element(MemoryElement::new("toast", "div").text("Saved")),
        )
        .await;

        wait_for_element(
            &mut session,
            &Locator::text("Loading"),
            ElementCondition::Hidden,
            PageTarget::Current,
            waits(1_000),
        )
        .await
        .unwrap();

        // An unreadable DOM is neither hidden nor detached
        browser.flaky_frames(100);
        let err = wait_for_element(
            &mut session,
            &Locator::text("Saved"),
            ElementCondition::Detached,
            PageTarget::Current,
            waits(300),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, E2eError::TimedOut { .. }), "{}", err);
        session.release().await;
    }
}
