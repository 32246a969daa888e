//! Browser session lifetime
//!
//! A [`Session`] owns one driver process (optional), one isolated browser
//! context and the pages opened in it. It belongs to exactly one scenario run
//! and is released on every exit path.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::BrowserConfig;
use crate::driver::{BrowserDriver, DriverProcess, FrameInfo, Launcher, PageEvent, PageId};
use crate::error::{E2eError, E2eResult};
use crate::locator::PageTarget;

/// Upper bound for each teardown call
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Session {
    id: Uuid,
    process: Option<DriverProcess>,
    driver: Option<Box<dyn BrowserDriver>>,
    page_events: Option<mpsc::UnboundedReceiver<PageEvent>>,
    /// Open pages in open order; the last one is the current page
    pages: Vec<PageId>,
    released: bool,
}

impl Session {
    /// Start process, context and first page. On any failure, whatever was
    /// already started is released before the `Setup` error is returned.
    pub async fn acquire(launcher: &dyn Launcher, config: &BrowserConfig) -> E2eResult<Self> {
        let mut session = Session {
            id: Uuid::new_v4(),
            process: None,
            driver: None,
            page_events: None,
            pages: Vec::new(),
            released: false,
        };
        info!(session = %session.id, "Acquiring {} session", config.kind.as_str());

        match session.start(launcher, config).await {
            Ok(()) => Ok(session),
            Err(e) => {
                warn!(session = %session.id, "Session setup failed: {}", e);
                session.release().await;
                Err(match e {
                    E2eError::Setup(_) => e,
                    other => E2eError::Setup(other.to_string()),
                })
            }
        }
    }

    async fn start(&mut self, launcher: &dyn Launcher, config: &BrowserConfig) -> E2eResult<()> {
        self.process = launcher.start_process(config).await?;

        let mut driver = launcher.connect(config, self.process.as_ref()).await?;
        self.page_events = Some(driver.subscribe_pages());
        self.driver = Some(driver);

        let first = self.driver()?.open_page().await?;
        self.sync_pages();
        if !self.pages.contains(&first) {
            self.pages.push(first);
        }
        Ok(())
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Drain page events into the ordered page list
    fn sync_pages(&mut self) {
        let Some(events) = self.page_events.as_mut() else {
            return;
        };
        while let Ok(event) = events.try_recv() {
            match event {
                PageEvent::Opened(page) => {
                    if !self.pages.contains(&page) {
                        debug!(session = %self.id, "Page opened: {}", page);
                        self.pages.push(page);
                    }
                }
                PageEvent::Closed(page) => {
                    debug!(session = %self.id, "Page closed: {}", page);
                    self.pages.retain(|p| p != &page);
                }
            }
        }
    }

    /// Open pages in open order
    pub fn pages(&mut self) -> &[PageId] {
        self.sync_pages();
        &self.pages
    }

    /// Most recently opened page still open
    pub fn current_page(&mut self) -> E2eResult<PageId> {
        self.sync_pages();
        self.pages
            .last()
            .cloned()
            .ok_or_else(|| E2eError::Driver("session has no open page".into()))
    }

    pub fn page(&mut self, target: PageTarget) -> E2eResult<PageId> {
        match target {
            PageTarget::Current => self.current_page(),
            PageTarget::Index(i) => {
                self.sync_pages();
                self.pages.get(i).cloned().ok_or_else(|| {
                    E2eError::Driver(format!("page {} is not open ({} open)", i, self.pages.len()))
                })
            }
        }
    }

    /// Live frame list of `page`
    pub async fn frames(&mut self, page: &PageId) -> E2eResult<Vec<FrameInfo>> {
        self.driver()?.frames(page).await
    }

    pub fn driver(&mut self) -> E2eResult<&mut (dyn BrowserDriver + 'static)> {
        match self.driver.as_mut() {
            Some(driver) => Ok(driver.as_mut()),
            None => Err(E2eError::Driver("session already released".into())),
        }
    }

    /// Close context, then browser, then driver process. Best-effort and
    /// idempotent: errors are logged, later calls do nothing.
    pub async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if let Some(mut driver) = self.driver.take() {
            match timeout(TEARDOWN_TIMEOUT, driver.close_context()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(session = %self.id, "Closing context failed: {}", e),
                Err(_) => warn!(session = %self.id, "Closing context timed out"),
            }
            match timeout(TEARDOWN_TIMEOUT, driver.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(session = %self.id, "Closing browser failed: {}", e),
                Err(_) => warn!(session = %self.id, "Closing browser timed out"),
            }
        }

        if let Some(mut process) = self.process.take() {
            if let Err(e) = process.stop().await {
                warn!(session = %self.id, "Stopping driver process failed: {}", e);
            }
        }

        self.page_events = None;
        self.pages.clear();
        info!(session = %self.id, "Session released");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.released {
            // DriverProcess kills itself on drop; the browser session is lost
            warn!(session = %self.id, "Session dropped without release");
        }
    }
}
