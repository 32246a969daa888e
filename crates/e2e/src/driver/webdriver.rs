//! WebDriver backend built on fantoccini
//!
//! One fantoccini client is one browser context. Pages are top-level
//! windows; frames are addressed by index path from the top-level document.
//! WebDriver has no push events, so window lists are diffed after any
//! operation that can open a page.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use fantoccini::error::{CmdError, ErrorStatus};
use fantoccini::elements::Element;
use fantoccini::wd::WindowHandle;
use fantoccini::{Client, ClientBuilder, Locator as WdLocator};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{
    BrowserDriver, DriverProcess, ElementHandle, ElementState, FrameInfo, FrameRef, Launcher, LoadState,
    PageEvent, PageId,
};
use crate::config::{BrowserConfig, BrowserKind};
use crate::error::{E2eError, E2eResult};
use crate::locator::{to_xpath, By};

/// Upper bound for establishing the WebDriver session
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Render-state check run against a single element
const INSPECT_SCRIPT: &str = r#"
    const el = arguments[0];
    if (!el || !el.isConnected) {
        return { attached: false };
    }
    const r = el.getBoundingClientRect();
    const style = window.getComputedStyle(el);
    const displayed = style.display !== 'none'
        && style.visibility !== 'hidden'
        && parseFloat(style.opacity || '1') > 0;
    let covered = false;
    if (r.width > 0 && r.height > 0) {
        const cx = r.left + r.width / 2;
        const cy = r.top + r.height / 2;
        if (cx >= 0 && cy >= 0 && cx < window.innerWidth && cy < window.innerHeight) {
            const top = document.elementFromPoint(cx, cy);
            covered = !!top && top !== el && !el.contains(top);
        }
    }
    return {
        attached: true,
        displayed: displayed,
        enabled: !el.disabled && el.getAttribute('aria-disabled') !== 'true',
        covered: covered,
        rect: { x: r.left, y: r.top, width: r.width, height: r.height },
    };
"#;

/// Starts chromedriver/geckodriver (unless a remote URL is configured) and
/// opens WebDriver sessions against it
#[derive(Debug, Clone, Copy, Default)]
pub struct WebDriverLauncher;

impl WebDriverLauncher {
    /// W3C capabilities for the configured browser
    pub fn capabilities(config: &BrowserConfig) -> serde_json::Map<String, Value> {
        let mut caps = serde_json::Map::new();
        let mut args: Vec<Value> = Vec::new();

        match config.kind {
            BrowserKind::Chrome => {
                if config.headless {
                    args.push(Value::String("--headless=new".to_string()));
                }
                args.push(Value::String(format!(
                    "--window-size={},{}",
                    config.viewport.width, config.viewport.height
                )));
                args.extend(config.args.iter().cloned().map(Value::String));

                caps.insert("browserName".to_string(), Value::String("chrome".to_string()));
                caps.insert("goog:chromeOptions".to_string(), json!({ "args": args }));
            }
            BrowserKind::Firefox => {
                if config.headless {
                    args.push(Value::String("-headless".to_string()));
                }
                args.push(Value::String(format!("--width={}", config.viewport.width)));
                args.push(Value::String(format!("--height={}", config.viewport.height)));
                // Chrome-only switches would make geckodriver reject the session
                args.extend(
                    config
                        .args
                        .iter()
                        .filter(|a| !a.starts_with("--disable-dev-shm"))
                        .cloned()
                        .map(Value::String),
                );

                caps.insert("browserName".to_string(), Value::String("firefox".to_string()));
                caps.insert("moz:firefoxOptions".to_string(), json!({ "args": args }));
            }
        }
        caps
    }
}

#[async_trait]
impl Launcher for WebDriverLauncher {
    async fn start_process(&self, config: &BrowserConfig) -> E2eResult<Option<DriverProcess>> {
        if config.webdriver.url.is_some() {
            return Ok(None);
        }
        DriverProcess::spawn(config).await.map(Some)
    }

    async fn connect(
        &self,
        config: &BrowserConfig,
        process: Option<&DriverProcess>,
    ) -> E2eResult<Box<dyn BrowserDriver>> {
        let url = process
            .map(|p| p.url.clone())
            .or_else(|| config.webdriver.url.clone())
            .ok_or_else(|| E2eError::Setup("no WebDriver endpoint: set webdriver.url or let uiflow spawn one".into()))?;

        info!("Connecting to WebDriver at {}", url);
        let mut builder = ClientBuilder::native();
        let connect = builder.capabilities(Self::capabilities(config)).connect(&url);

        let client = tokio::time::timeout(CONNECT_TIMEOUT, connect)
            .await
            .map_err(|_| {
                E2eError::Setup(format!(
                    "Connection to WebDriver timed out after {} seconds",
                    CONNECT_TIMEOUT.as_secs()
                ))
            })?
            .map_err(|e| E2eError::Setup(format!("Failed to start browser session: {}", e)))?;

        Ok(Box::new(WebDriverBrowser::new(client)))
    }
}

/// A live WebDriver session
pub struct WebDriverBrowser {
    client: Client,
    /// Known windows in open order
    windows: Vec<(PageId, WindowHandle)>,
    /// Where the client's browsing context currently points
    focused: Option<(PageId, FrameRef)>,
    elements: ElementCache<Element>,
    events: Option<mpsc::UnboundedSender<PageEvent>>,
    closed: bool,
}

impl WebDriverBrowser {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            windows: Vec::new(),
            focused: None,
            elements: ElementCache::default(),
            events: None,
            closed: false,
        }
    }

    fn emit(&self, event: PageEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn window(&self, page: &PageId) -> E2eResult<WindowHandle> {
        self.windows
            .iter()
            .find(|(id, _)| id == page)
            .map(|(_, handle)| handle.clone())
            .ok_or_else(|| E2eError::Driver(format!("no such page: {}", page)))
    }

    /// Diff the browser's window list against the known one
    async fn sync_windows(&mut self) -> E2eResult<()> {
        let live = self.client.windows().await.map_err(driver_error)?;

        let gone: Vec<PageId> = self
            .windows
            .iter()
            .filter(|(_, h)| !live.contains(h))
            .map(|(id, _)| id.clone())
            .collect();
        for id in gone {
            self.windows.retain(|(known, _)| known != &id);
            if matches!(&self.focused, Some((p, _)) if p == &id) {
                self.focused = None;
            }
            self.elements.forget_page(&id);
            self.emit(PageEvent::Closed(id));
        }

        for handle in live {
            if !self.windows.iter().any(|(_, h)| h == &handle) {
                let id = PageId(String::from(handle.clone()));
                debug!("New window {}", id);
                self.windows.push((id.clone(), handle));
                self.emit(PageEvent::Opened(id));
            }
        }
        Ok(())
    }

    /// Point the client at `frame` of `page`
    async fn focus(&mut self, page: &PageId, frame: &FrameRef) -> E2eResult<()> {
        if matches!(&self.focused, Some((p, f)) if p == page && f == frame) {
            return Ok(());
        }
        let window_changed = !matches!(&self.focused, Some((p, _)) if p == page);
        self.focused = None;

        if window_changed {
            let handle = self.window(page)?;
            self.client.switch_to_window(handle).await.map_err(driver_error)?;
        }
        self.client.enter_frame(None).await.map_err(driver_error)?;
        for index in &frame.0 {
            self.client
                .enter_frame(Some(*index))
                .await
                .map_err(|e| E2eError::Driver(format!("frame {} detached: {}", frame, e)))?;
        }

        self.focused = Some((page.clone(), frame.clone()));
        Ok(())
    }

    async fn script(&mut self, script: &str, args: Vec<Value>) -> E2eResult<Value> {
        self.client.execute(script, args).await.map_err(driver_error)
    }

    /// Enumerate the frame tree below the focused frame, preorder
    async fn collect_frames(&mut self, page: &PageId, root: FrameRef, out: &mut Vec<FrameInfo>) -> E2eResult<()> {
        let mut stack = vec![root];
        while let Some(frame) = stack.pop() {
            let listing = match self.list_frame(page, &frame).await {
                Ok(listing) => listing,
                Err(e) if frame.is_main() => return Err(e),
                Err(e) => {
                    // Detached between the parent's count and now
                    debug!("Skipping frame {}: {}", frame, e);
                    continue;
                }
            };
            let count = listing.get(0).and_then(Value::as_u64).unwrap_or(0) as u16;
            let name = listing.get(1).and_then(Value::as_str).map(String::from);

            for index in (0..count).rev() {
                stack.push(frame.child(index));
            }
            out.push(FrameInfo { frame, name });
        }
        Ok(())
    }

    async fn list_frame(&mut self, page: &PageId, frame: &FrameRef) -> E2eResult<Value> {
        self.focus(page, frame).await?;
        self.script("return [window.frames.length, window.name || null];", vec![])
            .await
    }

    fn element(&self, handle: &ElementHandle) -> E2eResult<Element> {
        self.elements
            .get(&handle.id)
            .ok_or_else(|| E2eError::StaleElement(format!("unknown element {}", handle.id)))
    }
}

#[async_trait]
impl BrowserDriver for WebDriverBrowser {
    fn subscribe_pages(&mut self) -> mpsc::UnboundedReceiver<PageEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(tx);
        rx
    }

    async fn open_page(&mut self) -> E2eResult<PageId> {
        if self.windows.is_empty() {
            // A fresh session comes with one window
            self.sync_windows().await?;
            if let Some((id, _)) = self.windows.last() {
                return Ok(id.clone());
            }
        }
        let created = self.client.new_window(true).await.map_err(driver_error)?;
        let id = PageId(String::from(created.handle.clone()));
        self.windows.push((id.clone(), created.handle));
        self.emit(PageEvent::Opened(id.clone()));
        Ok(id)
    }

    async fn navigate(&mut self, page: &PageId, url: &str) -> E2eResult<()> {
        self.focus(page, &FrameRef::main()).await?;
        self.client.goto(url).await.map_err(driver_error)?;
        self.focused = Some((page.clone(), FrameRef::main()));
        self.elements.forget_page(page);
        Ok(())
    }

    async fn frames(&mut self, page: &PageId) -> E2eResult<Vec<FrameInfo>> {
        let mut out = Vec::new();
        self.collect_frames(page, FrameRef::main(), &mut out).await?;
        Ok(out)
    }

    async fn load_state(&mut self, page: &PageId, frame: &FrameRef) -> E2eResult<LoadState> {
        self.focus(page, frame).await?;
        let state = self.script("return document.readyState;", vec![]).await?;
        Ok(LoadState::from_ready_state(state.as_str().unwrap_or("loading")))
    }

    async fn find_all(&mut self, page: &PageId, frame: &FrameRef, by: &By) -> E2eResult<Vec<ElementHandle>> {
        self.focus(page, frame).await?;
        let xpath = to_xpath(by);
        let found = self
            .client
            .find_all(WdLocator::XPath(&xpath))
            .await
            .map_err(driver_error)?;

        Ok(found
            .into_iter()
            .map(|element| {
                let id = element.element_id().to_string();
                self.elements.insert(id.clone(), page, element);
                ElementHandle {
                    id,
                    page: page.clone(),
                    frame: frame.clone(),
                }
            })
            .collect())
    }

    async fn inspect(&mut self, handle: &ElementHandle) -> E2eResult<ElementState> {
        let Ok(element) = self.element(handle) else {
            return Ok(ElementState::detached());
        };
        if self.focus(&handle.page, &handle.frame).await.is_err() {
            return Ok(ElementState::detached());
        }
        let arg = serde_json::to_value(&element)?;
        match self.client.execute(INSPECT_SCRIPT, vec![arg]).await {
            Ok(value) => Ok(serde_json::from_value(value)?),
            Err(e) if is_stale(&e) => {
                self.elements.remove(&handle.id);
                Ok(ElementState::detached())
            }
            Err(e) => Err(driver_error(e)),
        }
    }

    async fn fill(&mut self, handle: &ElementHandle, value: &str) -> E2eResult<()> {
        let element = self.element(handle)?;
        self.focus(&handle.page, &handle.frame).await?;
        element.clear().await.map_err(|e| element_error(handle, e))?;
        element.send_keys(value).await.map_err(|e| element_error(handle, e))?;
        Ok(())
    }

    async fn click(&mut self, handle: &ElementHandle) -> E2eResult<()> {
        let element = self.element(handle)?;
        self.focus(&handle.page, &handle.frame).await?;
        element.click().await.map_err(|e| element_error(handle, e))?;
        // The click may have navigated or replaced the frame we are in
        self.focused = None;
        self.sync_windows().await
    }

    async fn scroll(&mut self, page: &PageId, dx: i64, dy: i64) -> E2eResult<()> {
        self.focus(page, &FrameRef::main()).await?;
        self.script("window.scrollBy(arguments[0], arguments[1]);", vec![json!(dx), json!(dy)])
            .await?;
        Ok(())
    }

    async fn close_context(&mut self) -> E2eResult<()> {
        let windows = std::mem::take(&mut self.windows);
        self.focused = None;
        self.elements.clear();
        let mut first_error = None;
        for (id, handle) in windows {
            let closed = match self.client.switch_to_window(handle).await {
                Ok(()) => self.client.close_window().await,
                Err(e) => Err(e),
            };
            if let Err(e) = closed {
                debug!("Closing window {} failed: {}", id, e);
                first_error.get_or_insert(e);
            }
            self.emit(PageEvent::Closed(id));
        }
        match first_error {
            Some(e) => Err(driver_error(e)),
            None => Ok(()),
        }
    }

    async fn shutdown(&mut self) -> E2eResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Err(e) = self.client.clone().close().await {
            // Closing the last window already ends the session on some drivers
            debug!("Ending WebDriver session: {}", e);
        }
        Ok(())
    }
}

fn is_stale(e: &CmdError) -> bool {
    matches!(e, CmdError::Standard(w) if w.error == ErrorStatus::StaleElementReference)
}

fn driver_error(e: CmdError) -> E2eError {
    if is_stale(&e) {
        return E2eError::StaleElement(e.to_string());
    }
    E2eError::Driver(e.to_string())
}

/// Element references handed out by `find_all`, keyed by WebDriver id.
/// Entries live until their page navigates or closes.
#[derive(Debug)]
struct ElementCache<E> {
    entries: HashMap<String, (PageId, E)>,
}

impl<E> Default for ElementCache<E> {
    fn default() -> Self {
        Self { entries: HashMap::new() }
    }
}

impl<E: Clone> ElementCache<E> {
    fn insert(&mut self, id: String, page: &PageId, element: E) {
        self.entries.insert(id, (page.clone(), element));
    }

    fn get(&self, id: &str) -> Option<E> {
        self.entries.get(id).map(|(_, e)| e.clone())
    }

    fn remove(&mut self, id: &str) {
        self.entries.remove(id);
    }

    fn forget_page(&mut self, page: &PageId) {
        self.entries.retain(|_, (owner, _)| owner != page);
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

fn element_error(handle: &ElementHandle, e: CmdError) -> E2eError {
    match &e {
        CmdError::Standard(w) if w.error == ErrorStatus::ElementNotInteractable => {
            E2eError::ElementNotInteractable {
                locator: format!("element {}", handle.id),
                observed: w.to_string(),
            }
        }
        _ => driver_error(e),
    }
}
