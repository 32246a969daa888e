//! Element and page actions
//!
//! Each element action re-resolves its locator and waits for the element to
//! be actionable before touching it.

use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::{debug, info};

use crate::driver::LoadState;
use crate::error::{E2eError, E2eResult};
use crate::locator::{Locator, PageTarget};
use crate::session::Session;
use crate::wait::{wait_for_actionable, wait_for_load, WaitSpec};

/// Longest post-click settle allowed
pub const MAX_SETTLE: Duration = Duration::from_secs(1);

/// Clear the element and type `value`. A stale element is re-resolved and
/// the fill retried once.
pub async fn fill(
    session: &mut Session,
    locator: &Locator,
    value: &str,
    target: PageTarget,
    wait: WaitSpec,
) -> E2eResult<()> {
    let handle = wait_for_actionable(session, locator, target, wait).await?;
    match session.driver()?.fill(&handle, value).await {
        Err(e) if e.is_stale() => {
            debug!("Element {} went stale during fill, retrying once: {}", locator, e);
            let handle = wait_for_actionable(session, locator, target, wait).await?;
            session.driver()?.fill(&handle, value).await
        }
        result => result,
    }
}

/// Click, let the page settle, then pick up any page the click opened
pub async fn click(
    session: &mut Session,
    locator: &Locator,
    target: PageTarget,
    wait: WaitSpec,
    settle: Duration,
    load: WaitSpec,
) -> E2eResult<()> {
    let before = session.pages().len();
    let handle = wait_for_actionable(session, locator, target, wait).await?;
    session.driver()?.click(&handle).await?;

    sleep(settle.min(MAX_SETTLE)).await;

    let page = session.current_page()?;
    if session.pages().len() > before {
        info!("Click on {} opened page {}", locator, page);
    }
    wait_for_load(session, &page, LoadState::DomContentLoaded, load).await;
    Ok(())
}

/// Load `url` (already absolute) in the current page, then wait best-effort
/// for every frame to reach `wait_until`
pub async fn navigate(
    session: &mut Session,
    url: &str,
    wait_until: LoadState,
    navigation_timeout: Duration,
    load: WaitSpec,
) -> E2eResult<()> {
    let page = session.current_page()?;
    debug!("Navigating page {} to {}", page, url);

    let driver = session.driver()?;
    match timeout(navigation_timeout, driver.navigate(&page, url)).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(E2eError::TimedOut {
                what: format!("navigation to {}", url),
                waited_ms: navigation_timeout.as_millis() as u64,
            })
        }
    }

    wait_for_load(session, &page, wait_until, load).await;
    Ok(())
}

/// Scroll the page viewport by (dx, dy) pixels
pub async fn scroll(session: &mut Session, target: PageTarget, dx: i64, dy: i64) -> E2eResult<()> {
    let page = session.page(target)?;
    session.driver()?.scroll(&page, dx, dy).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrowserConfig;
    use crate::driver::memory::{ClickEffect, MemoryBrowser, MemoryElement, MemoryFrame};

    fn waits() -> WaitSpec {
        WaitSpec::new(Duration::from_secs(5), Duration::from_millis(100))
    }

    async fn session_at(browser: &MemoryBrowser, url: &str) -> Session {
        let mut session = Session::acquire(browser, &BrowserConfig::default()).await.unwrap();
        navigate(&mut session, url, LoadState::Load, Duration::from_secs(10), waits())
            .await
            .unwrap();
        session
    }

    #[tokio::test(start_paused = true)]
    async fn test_fill_retries_once_on_stale() {
        let browser = MemoryBrowser::new();
        browser.route(
            "http://app/login",
            MemoryFrame::new().element(MemoryElement::new("email", "input").label("Email").stale_fills(1)),
        );
        let mut session = session_at(&browser, "http://app/login").await;

        let email = Locator::role("textbox", Some("Email"));
        fill(&mut session, &email, "user@example.com", PageTarget::Current, waits())
            .await
            .unwrap();

        assert_eq!(browser.stats().fills, vec![("email".into(), "user@example.com".into())]);
        session.release().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_fill_surfaces_second_stale() {
        let browser = MemoryBrowser::new();
        browser.route(
            "http://app/login",
            MemoryFrame::new().element(MemoryElement::new("email", "input").label("Email").stale_fills(2)),
        );
        let mut session = session_at(&browser, "http://app/login").await;

        let err = fill(
            &mut session,
            &Locator::role("textbox", Some("Email")),
            "x",
            PageTarget::Current,
            waits(),
        )
        .await
        .unwrap_err();

        assert!(err.is_stale(), "expected stale error, got {}", err);
        assert!(browser.stats().fills.is_empty());
        session.release().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_click_switches_to_opened_page() {
        let browser = MemoryBrowser::new();
        browser.route(
            "http://app/",
            MemoryFrame::new().element(
                MemoryElement::new("docs", "a")
                    .text("Docs")
                    .on_click(ClickEffect::OpenPage("http://app/docs".into())),
            ),
        );
        browser.route(
            "http://app/docs",
            MemoryFrame::new().element(MemoryElement::new("title", "h1").text("Documentation")),
        );
        let mut session = session_at(&browser, "http://app/").await;
        let first = session.current_page().unwrap();

        click(
            &mut session,
            &Locator::text("Docs"),
            PageTarget::Current,
            waits(),
            Duration::from_millis(500),
            waits(),
        )
        .await
        .unwrap();

        assert_eq!(session.pages().len(), 2);
        assert_ne!(session.current_page().unwrap(), first);
        assert_eq!(session.page(PageTarget::Index(0)).unwrap(), first);
        session.release().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_click_settle_is_capped() {
        let browser = MemoryBrowser::new();
        browser.route(
            "http://app/",
            MemoryFrame::new().element(MemoryElement::new("go", "button").text("Go")),
        );
        let mut session = session_at(&browser, "http://app/").await;

        let start = tokio::time::Instant::now();
        click(
            &mut session,
            &Locator::role("button", Some("Go")),
            PageTarget::Current,
            waits(),
            Duration::from_secs(30),
            waits(),
        )
        .await
        .unwrap();

        // one poll for stability plus the capped settle
        assert_eq!(start.elapsed(), Duration::from_millis(100) + MAX_SETTLE);
        session.release().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_navigate_tolerates_frame_load_errors() {
        let browser = MemoryBrowser::new();
        browser.route(
            "http://app/",
            MemoryFrame::new()
                .child(MemoryFrame::new().named("ads").failing_load())
                .child(MemoryFrame::new().named("slow").load_after(Duration::from_secs(60))),
        );
        let mut session = Session::acquire(&browser, &BrowserConfig::default()).await.unwrap();

        let start = tokio::time::Instant::now();
        navigate(
            &mut session,
            "http://app/",
            LoadState::Load,
            Duration::from_secs(10),
            WaitSpec::new(Duration::from_secs(3), Duration::from_millis(100)),
        )
        .await
        .unwrap();

        // the slow frame exhausts the load wait, which only warns
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert!(start.elapsed() <= Duration::from_millis(3_100));
        session.release().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_scroll_targets_page() {
        let browser = MemoryBrowser::new();
        let mut session = session_at(&browser, "http://app/").await;
        scroll(&mut session, PageTarget::Current, 0, 250).await.unwrap();
        assert_eq!(browser.stats().scrolls, vec![(0, 250)]);
        session.release().await;
    }
}
