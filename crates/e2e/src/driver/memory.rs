//! In-memory browser backend
//!
//! Models pages, frames and elements without a real browser so scenario
//! logic can be exercised deterministically (pair with paused tokio time).
//! Sites are described up front as routes; behaviour over time is expressed
//! with delayed attachment, click effects, stale writes and unsettled boxes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{
    BrowserDriver, DriverProcess, ElementHandle, ElementState, FrameInfo, FrameRef, Launcher, LoadState,
    PageEvent, PageId, Rect,
};
use crate::config::BrowserConfig;
use crate::error::{E2eError, E2eResult};
use crate::locator::{to_xpath, By};

/// What a click on an element does
#[derive(Debug, Clone, PartialEq)]
pub enum ClickEffect {
    /// Attach the element with this key, wherever it is declared
    Reveal(String),
    /// Detach the element with this key
    Remove(String),
    /// Navigate the current page
    Navigate(String),
    /// Open a new page at this URL
    OpenPage(String),
}

/// Declarative element
#[derive(Debug, Clone)]
pub struct MemoryElement {
    pub key: String,
    pub tag: String,
    pub role: Option<String>,
    pub text: String,
    pub label: Option<String>,
    pub xpath: Option<String>,
    pub displayed: bool,
    pub enabled: bool,
    pub covered: bool,
    pub rect: Rect,
    /// Absent from the DOM until revealed by a click
    pub hidden_until_revealed: bool,
    /// Absent from the DOM until this long after navigation
    pub attach_after: Option<Duration>,
    /// Number of fills that find the element re-rendered underneath them
    pub stale_fills: u32,
    /// Number of inspections during which the box keeps moving
    pub unsettled_polls: u32,
    pub on_click: Vec<ClickEffect>,
}

impl MemoryElement {
    pub fn new(key: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            tag: tag.into(),
            role: None,
            text: String::new(),
            label: None,
            xpath: None,
            displayed: true,
            enabled: true,
            covered: false,
            rect: Rect { x: 10.0, y: 10.0, width: 120.0, height: 32.0 },
            hidden_until_revealed: false,
            attach_after: None,
            stale_fills: 0,
            unsettled_polls: 0,
            on_click: Vec::new(),
        }
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn xpath(mut self, xpath: impl Into<String>) -> Self {
        self.xpath = Some(to_xpath(&By::Path { xpath: xpath.into() }));
        self
    }

    pub fn invisible(mut self) -> Self {
        self.displayed = false;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn covered(mut self) -> Self {
        self.covered = true;
        self
    }

    pub fn revealed_by_click(mut self) -> Self {
        self.hidden_until_revealed = true;
        self
    }

    pub fn attach_after(mut self, delay: Duration) -> Self {
        self.attach_after = Some(delay);
        self
    }

    pub fn stale_fills(mut self, count: u32) -> Self {
        self.stale_fills = count;
        self
    }

    pub fn unsettled_polls(mut self, count: u32) -> Self {
        self.unsettled_polls = count;
        self
    }

    pub fn on_click(mut self, effect: ClickEffect) -> Self {
        self.on_click.push(effect);
        self
    }

    fn implicit_role(&self) -> Option<&str> {
        if let Some(role) = &self.role {
            return Some(role);
        }
        match self.tag.as_str() {
            "button" => Some("button"),
            "a" => Some("link"),
            "input" | "textarea" => Some("textbox"),
            "select" => Some("combobox"),
            "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => Some("heading"),
            "li" => Some("listitem"),
            _ => None,
        }
    }

    fn matches(&self, by: &By) -> bool {
        match by {
            By::Role { role, name } => {
                self.implicit_role() == Some(role.as_str())
                    && name
                        .as_ref()
                        .map_or(true, |n| self.text.trim() == n || self.label.as_deref() == Some(n))
            }
            By::Text { text, exact: true } => self.text.trim() == text,
            By::Text { text, exact: false } => self.text.contains(text.as_str()),
            By::Path { .. } => self.xpath.as_deref() == Some(to_xpath(by).as_str()),
        }
    }
}

/// Declarative frame
#[derive(Debug, Clone)]
pub struct MemoryFrame {
    pub name: Option<String>,
    pub elements: Vec<MemoryElement>,
    pub children: Vec<MemoryFrame>,
    /// Reaches `load` this long after navigation
    pub load_after: Duration,
    /// Load-state checks fail for this frame
    pub load_error: bool,
}

impl MemoryFrame {
    pub fn new() -> Self {
        Self {
            name: None,
            elements: Vec::new(),
            children: Vec::new(),
            load_after: Duration::ZERO,
            load_error: false,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn element(mut self, element: MemoryElement) -> Self {
        self.elements.push(element);
        self
    }

    pub fn child(mut self, frame: MemoryFrame) -> Self {
        self.children.push(frame);
        self
    }

    pub fn load_after(mut self, delay: Duration) -> Self {
        self.load_after = delay;
        self
    }

    pub fn failing_load(mut self) -> Self {
        self.load_error = true;
        self
    }
}

impl Default for MemoryFrame {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters observable by tests
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub contexts_opened: u32,
    pub contexts_closed: u32,
    pub browsers_closed: u32,
    pub fills: Vec<(String, String)>,
    pub clicks: Vec<String>,
    pub scrolls: Vec<(i64, i64)>,
}

impl MemoryStats {
    /// Browsers started and not yet closed
    pub fn running(&self) -> u32 {
        self.contexts_opened.saturating_sub(self.browsers_closed)
    }
}

#[derive(Default)]
struct Site {
    routes: HashMap<String, MemoryFrame>,
    stats: MemoryStats,
    fail_connect: bool,
    fail_open_page: bool,
    /// Frame listings that fail before one succeeds
    frame_failures: u32,
}

/// A scripted site plus the launcher for it. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct MemoryBrowser {
    site: Arc<Mutex<Site>>,
}

impl MemoryBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `frame` (the main frame) at `url`
    pub fn route(&self, url: impl Into<String>, frame: MemoryFrame) -> &Self {
        self.site.lock().routes.insert(url.into(), frame);
        self
    }

    pub fn fail_connect(&self) -> &Self {
        self.site.lock().fail_connect = true;
        self
    }

    pub fn fail_open_page(&self) -> &Self {
        self.site.lock().fail_open_page = true;
        self
    }

    /// The next `count` frame listings fail as if a frame detached mid-walk
    pub fn flaky_frames(&self, count: u32) -> &Self {
        self.site.lock().frame_failures = count;
        self
    }

    pub fn stats(&self) -> MemoryStats {
        self.site.lock().stats.clone()
    }
}

#[async_trait]
impl Launcher for MemoryBrowser {
    async fn start_process(&self, _config: &BrowserConfig) -> E2eResult<Option<DriverProcess>> {
        Ok(None)
    }

    async fn connect(
        &self,
        _config: &BrowserConfig,
        _process: Option<&DriverProcess>,
    ) -> E2eResult<Box<dyn BrowserDriver>> {
        let mut site = self.site.lock();
        if site.fail_connect {
            return Err(E2eError::Setup("memory browser refused the connection".into()));
        }
        site.stats.contexts_opened += 1;
        Ok(Box::new(MemoryDriver {
            site: self.site.clone(),
            pages: Vec::new(),
            events: None,
            next_page: 0,
            next_element: 0,
            closed: false,
        }))
    }
}

struct LiveElement {
    id: String,
    def: MemoryElement,
    revealed: bool,
    removed: bool,
    value: String,
}

struct LiveFrame {
    frame: FrameRef,
    name: Option<String>,
    load_after: Duration,
    load_error: bool,
    elements: Vec<LiveElement>,
}

struct LivePage {
    id: PageId,
    url: String,
    navigated_at: Instant,
    frames: Vec<LiveFrame>,
    scroll: (i64, i64),
}

impl LivePage {
    fn attached(&self, element: &LiveElement) -> bool {
        if element.removed || (element.def.hidden_until_revealed && !element.revealed) {
            return false;
        }
        match element.def.attach_after {
            Some(delay) => self.navigated_at.elapsed() >= delay,
            None => true,
        }
    }
}

/// One browser context of a [`MemoryBrowser`]
pub struct MemoryDriver {
    site: Arc<Mutex<Site>>,
    pages: Vec<LivePage>,
    events: Option<mpsc::UnboundedSender<PageEvent>>,
    next_page: u32,
    next_element: u64,
    closed: bool,
}

impl MemoryDriver {
    fn ensure_open(&self) -> E2eResult<()> {
        if self.closed {
            return Err(E2eError::Driver("context is closed".into()));
        }
        Ok(())
    }

    fn emit(&self, event: PageEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn page_mut(&mut self, page: &PageId) -> E2eResult<&mut LivePage> {
        self.pages
            .iter_mut()
            .find(|p| &p.id == page)
            .ok_or_else(|| E2eError::Driver(format!("no such page: {}", page)))
    }

    fn page_ref(&self, page: &PageId) -> E2eResult<&LivePage> {
        self.pages
            .iter()
            .find(|p| &p.id == page)
            .ok_or_else(|| E2eError::Driver(format!("no such page: {}", page)))
    }

    fn fresh_id(&mut self) -> String {
        self.next_element += 1;
        format!("el-{}", self.next_element)
    }

    /// Instantiate the route for `url` with fresh element ids
    fn render(&mut self, url: &str) -> Vec<LiveFrame> {
        let root = self.site.lock().routes.get(url).cloned().unwrap_or_default();
        let mut out = Vec::new();
        let mut stack = vec![(FrameRef::main(), root)];
        while let Some((path, frame)) = stack.pop() {
            let elements = frame
                .elements
                .into_iter()
                .map(|def| LiveElement {
                    id: self.fresh_id(),
                    def,
                    revealed: false,
                    removed: false,
                    value: String::new(),
                })
                .collect();
            out.push(LiveFrame {
                frame: path.clone(),
                name: frame.name,
                load_after: frame.load_after,
                load_error: frame.load_error,
                elements,
            });
            for (i, child) in frame.children.into_iter().enumerate().rev() {
                stack.push((path.child(i as u16), child));
            }
        }
        out
    }

    fn load(&mut self, page: &PageId, url: &str) -> E2eResult<()> {
        let frames = self.render(url);
        let live = self.page_mut(page)?;
        live.url = url.to_string();
        live.navigated_at = Instant::now();
        live.frames = frames;
        Ok(())
    }

    fn create_page(&mut self, url: Option<&str>) -> E2eResult<PageId> {
        self.next_page += 1;
        let id = PageId(format!("page-{}", self.next_page));
        self.pages.push(LivePage {
            id: id.clone(),
            url: "about:blank".to_string(),
            navigated_at: Instant::now(),
            frames: vec![LiveFrame {
                frame: FrameRef::main(),
                name: None,
                load_after: Duration::ZERO,
                load_error: false,
                elements: Vec::new(),
            }],
            scroll: (0, 0),
        });
        if let Some(url) = url {
            self.load(&id, url)?;
        }
        self.emit(PageEvent::Opened(id.clone()));
        Ok(id)
    }

    fn locate(&self, handle: &ElementHandle) -> Option<(&LivePage, &LiveElement)> {
        let page = self.pages.iter().find(|p| p.id == handle.page)?;
        let frame = page.frames.iter().find(|f| f.frame == handle.frame)?;
        let element = frame.elements.iter().find(|e| e.id == handle.id)?;
        Some((page, element))
    }

    fn element_mut(&mut self, handle: &ElementHandle) -> E2eResult<&mut LiveElement> {
        let page = self.page_mut(&handle.page)?;
        let navigated_at = page.navigated_at;
        let element = page
            .frames
            .iter_mut()
            .find(|f| f.frame == handle.frame)
            .and_then(|f| f.elements.iter_mut().find(|e| e.id == handle.id));
        match element {
            Some(e) if !e.removed && (!e.def.hidden_until_revealed || e.revealed)
                && e.def.attach_after.map_or(true, |d| navigated_at.elapsed() >= d) =>
            {
                Ok(e)
            }
            _ => Err(E2eError::StaleElement(format!("element {} is no longer attached", handle.id))),
        }
    }

    fn set_all(&mut self, page: &PageId, key: &str, f: impl Fn(&mut LiveElement)) -> E2eResult<()> {
        let live = self.page_mut(page)?;
        for frame in &mut live.frames {
            for element in frame.elements.iter_mut().filter(|e| e.def.key == key) {
                f(element);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BrowserDriver for MemoryDriver {
    fn subscribe_pages(&mut self) -> mpsc::UnboundedReceiver<PageEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(tx);
        rx
    }

    async fn open_page(&mut self) -> E2eResult<PageId> {
        self.ensure_open()?;
        if self.site.lock().fail_open_page {
            return Err(E2eError::Driver("memory browser could not open a page".into()));
        }
        self.create_page(None)
    }

    async fn navigate(&mut self, page: &PageId, url: &str) -> E2eResult<()> {
        self.ensure_open()?;
        self.load(page, url)
    }

    async fn frames(&mut self, page: &PageId) -> E2eResult<Vec<FrameInfo>> {
        self.ensure_open()?;
        {
            let mut site = self.site.lock();
            if site.frame_failures > 0 {
                site.frame_failures -= 1;
                return Err(E2eError::Driver(format!("frame {} detached: no such frame", FrameRef::main().child(0))));
            }
        }
        let live = self.page_ref(page)?;
        Ok(live
            .frames
            .iter()
            .map(|f| FrameInfo {
                frame: f.frame.clone(),
                name: f.name.clone(),
            })
            .collect())
    }

    async fn load_state(&mut self, page: &PageId, frame: &FrameRef) -> E2eResult<LoadState> {
        self.ensure_open()?;
        let live = self.page_ref(page)?;
        let f = live
            .frames
            .iter()
            .find(|f| &f.frame == frame)
            .ok_or_else(|| E2eError::Driver(format!("frame {} detached", frame)))?;
        if f.load_error {
            return Err(E2eError::Driver(format!("frame {} failed to load", frame)));
        }
        if live.navigated_at.elapsed() >= f.load_after {
            Ok(LoadState::Load)
        } else {
            Ok(LoadState::Loading)
        }
    }

    async fn find_all(&mut self, page: &PageId, frame: &FrameRef, by: &By) -> E2eResult<Vec<ElementHandle>> {
        self.ensure_open()?;
        let live = self.page_ref(page)?;
        let f = live
            .frames
            .iter()
            .find(|f| &f.frame == frame)
            .ok_or_else(|| E2eError::Driver(format!("frame {} detached", frame)))?;
        Ok(f.elements
            .iter()
            .filter(|e| live.attached(e) && e.def.matches(by))
            .map(|e| ElementHandle {
                id: e.id.clone(),
                page: page.clone(),
                frame: frame.clone(),
            })
            .collect())
    }

    async fn inspect(&mut self, element: &ElementHandle) -> E2eResult<ElementState> {
        self.ensure_open()?;
        let Some((page, live)) = self.locate(element) else {
            return Ok(ElementState::detached());
        };
        if !page.attached(live) {
            return Ok(ElementState::detached());
        }
        let mut state = ElementState {
            attached: true,
            displayed: live.def.displayed,
            enabled: live.def.enabled,
            covered: live.def.covered,
            rect: live.def.rect,
        };
        if let Ok(e) = self.element_mut(element) {
            if e.def.unsettled_polls > 0 {
                e.def.unsettled_polls -= 1;
                e.def.rect.y += 8.0;
                state.rect = e.def.rect;
            }
        }
        Ok(state)
    }

    async fn fill(&mut self, element: &ElementHandle, value: &str) -> E2eResult<()> {
        self.ensure_open()?;
        let fresh = self.fresh_id();
        let e = self.element_mut(element)?;
        if e.def.stale_fills > 0 {
            // Re-rendered: same recipe, new identity
            e.def.stale_fills -= 1;
            e.id = fresh;
            return Err(E2eError::StaleElement(format!(
                "element {} was re-rendered during fill",
                element.id
            )));
        }
        e.value = value.to_string();
        let key = e.def.key.clone();
        self.site.lock().stats.fills.push((key, value.to_string()));
        Ok(())
    }

    async fn click(&mut self, element: &ElementHandle) -> E2eResult<()> {
        self.ensure_open()?;
        let e = self.element_mut(element)?;
        let key = e.def.key.clone();
        let effects = e.def.on_click.clone();
        self.site.lock().stats.clicks.push(key);

        for effect in effects {
            match effect {
                ClickEffect::Reveal(key) => self.set_all(&element.page, &key, |e| e.revealed = true)?,
                ClickEffect::Remove(key) => self.set_all(&element.page, &key, |e| e.removed = true)?,
                ClickEffect::Navigate(url) => self.load(&element.page, &url)?,
                ClickEffect::OpenPage(url) => {
                    self.create_page(Some(&url))?;
                }
            }
        }
        Ok(())
    }

    async fn scroll(&mut self, page: &PageId, dx: i64, dy: i64) -> E2eResult<()> {
        self.ensure_open()?;
        let live = self.page_mut(page)?;
        live.scroll = (live.scroll.0 + dx, live.scroll.1 + dy);
        self.site.lock().stats.scrolls.push((dx, dy));
        Ok(())
    }

    async fn close_context(&mut self) -> E2eResult<()> {
        for page in std::mem::take(&mut self.pages) {
            self.emit(PageEvent::Closed(page.id));
        }
        if !self.closed {
            self.closed = true;
            self.site.lock().stats.contexts_closed += 1;
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> E2eResult<()> {
        self.closed = true;
        self.site.lock().stats.browsers_closed += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn driver_for(browser: &MemoryBrowser) -> Box<dyn BrowserDriver> {
        browser.connect(&BrowserConfig::default(), None).await.unwrap()
    }

    #[tokio::test]
    async fn test_route_renders_frames_in_document_order() {
        let browser = MemoryBrowser::new();
        browser.route(
            "http://app/",
            MemoryFrame::new()
                .child(MemoryFrame::new().named("a").child(MemoryFrame::new().named("a1")))
                .child(MemoryFrame::new().named("b")),
        );
        let mut driver = driver_for(&browser).await;
        let page = driver.open_page().await.unwrap();
        driver.navigate(&page, "http://app/").await.unwrap();

        let frames: Vec<String> = driver
            .frames(&page)
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.frame.to_string())
            .collect();
        assert_eq!(frames, vec!["main", "main/0", "main/0/0", "main/1"]);
    }

    #[tokio::test]
    async fn test_stale_fill_changes_identity() {
        let browser = MemoryBrowser::new();
        browser.route(
            "http://app/",
            MemoryFrame::new().element(MemoryElement::new("email", "input").label("Email").stale_fills(1)),
        );
        let mut driver = driver_for(&browser).await;
        let page = driver.open_page().await.unwrap();
        driver.navigate(&page, "http://app/").await.unwrap();

        let by = By::Role { role: "textbox".into(), name: Some("Email".into()) };
        let first = driver.find_all(&page, &FrameRef::main(), &by).await.unwrap().remove(0);
        assert!(driver.fill(&first, "a@b.c").await.unwrap_err().is_stale());
        assert!(!driver.inspect(&first).await.unwrap().attached);

        let second = driver.find_all(&page, &FrameRef::main(), &by).await.unwrap().remove(0);
        assert_ne!(first.id, second.id);
        driver.fill(&second, "a@b.c").await.unwrap();
        assert_eq!(browser.stats().fills, vec![("email".to_string(), "a@b.c".to_string())]);
    }

    #[tokio::test]
    async fn test_close_context_emits_closed_events() {
        let browser = MemoryBrowser::new();
        let mut driver = driver_for(&browser).await;
        let mut events = driver.subscribe_pages();
        let page = driver.open_page().await.unwrap();
        driver.close_context().await.unwrap();

        assert_eq!(events.recv().await, Some(PageEvent::Opened(page.clone())));
        assert_eq!(events.recv().await, Some(PageEvent::Closed(page)));
        assert_eq!(browser.stats().contexts_closed, 1);
    }
}
