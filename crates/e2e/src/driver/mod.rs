//! Browser driver seam
//!
//! Everything above this module talks to a browser through [`BrowserDriver`]
//! and obtains one through a [`Launcher`]. Two backends exist:
//! - [`webdriver`]: fantoccini against chromedriver/geckodriver
//! - [`memory`]: an in-process DOM model for deterministic runs

pub mod memory;
pub mod process;
pub mod webdriver;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::BrowserConfig;
use crate::error::E2eResult;
use crate::locator::By;

pub use process::DriverProcess;

/// Opaque identity of a top-level page (WebDriver window handle)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageId(pub String);

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Path from the page's main frame to a nested frame, by child index
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct FrameRef(pub Vec<u16>);

impl FrameRef {
    pub fn main() -> Self {
        Self(Vec::new())
    }

    pub fn is_main(&self) -> bool {
        self.0.is_empty()
    }

    pub fn child(&self, index: u16) -> Self {
        let mut path = self.0.clone();
        path.push(index);
        Self(path)
    }
}

impl fmt::Display for FrameRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_main() {
            return f.write_str("main");
        }
        let parts: Vec<String> = self.0.iter().map(|i| i.to_string()).collect();
        write!(f, "main/{}", parts.join("/"))
    }
}

/// A frame as seen at enumeration time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameInfo {
    pub frame: FrameRef,
    pub name: Option<String>,
}

/// Transient handle to a live element. Rebound on every use.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ElementHandle {
    pub id: String,
    pub page: PageId,
    pub frame: FrameRef,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn is_empty(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }
}

/// Snapshot of an element's render state at inspection time
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElementState {
    pub attached: bool,
    pub displayed: bool,
    pub enabled: bool,
    pub covered: bool,
    pub rect: Rect,
}

impl ElementState {
    pub fn detached() -> Self {
        Self::default()
    }

    /// Attached, rendered with a non-zero box, and not covered by another element
    pub fn is_visible(&self) -> bool {
        self.attached && self.displayed && !self.rect.is_empty() && !self.covered
    }

    pub fn describe(&self) -> String {
        if !self.attached {
            "detached".to_string()
        } else if !self.displayed || self.rect.is_empty() {
            "not rendered (hidden or zero size)".to_string()
        } else if self.covered {
            "covered by another element".to_string()
        } else if !self.enabled {
            "disabled".to_string()
        } else {
            "visible and enabled".to_string()
        }
    }
}

/// Document load progress, ordered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadState {
    Loading,
    #[default]
    DomContentLoaded,
    Load,
}

impl LoadState {
    /// Map `document.readyState`
    pub fn from_ready_state(state: &str) -> Self {
        match state {
            "complete" => LoadState::Load,
            "interactive" => LoadState::DomContentLoaded,
            _ => LoadState::Loading,
        }
    }
}

impl fmt::Display for LoadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LoadState::Loading => "loading",
            LoadState::DomContentLoaded => "domcontentloaded",
            LoadState::Load => "load",
        };
        f.write_str(s)
    }
}

/// Page lifecycle notifications published by a driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageEvent {
    Opened(PageId),
    Closed(PageId),
}

/// Operations the runner needs from a browser context
#[async_trait]
pub trait BrowserDriver: Send {
    /// Register the page-event listener. Called once, at context creation.
    fn subscribe_pages(&mut self) -> mpsc::UnboundedReceiver<PageEvent>;

    /// Open a new page in the context
    async fn open_page(&mut self) -> E2eResult<PageId>;

    async fn navigate(&mut self, page: &PageId, url: &str) -> E2eResult<()>;

    /// Live frame list of a page, main frame first
    async fn frames(&mut self, page: &PageId) -> E2eResult<Vec<FrameInfo>>;

    async fn load_state(&mut self, page: &PageId, frame: &FrameRef) -> E2eResult<LoadState>;

    /// Query one frame; document order
    async fn find_all(&mut self, page: &PageId, frame: &FrameRef, by: &By) -> E2eResult<Vec<ElementHandle>>;

    /// Inspect render state. A detached element is reported, not an error.
    async fn inspect(&mut self, element: &ElementHandle) -> E2eResult<ElementState>;

    /// Clear and type. Fails with `StaleElement` if the element detached.
    async fn fill(&mut self, element: &ElementHandle, value: &str) -> E2eResult<()>;

    async fn click(&mut self, element: &ElementHandle) -> E2eResult<()>;

    async fn scroll(&mut self, page: &PageId, dx: i64, dy: i64) -> E2eResult<()>;

    /// Close every page of the context
    async fn close_context(&mut self) -> E2eResult<()>;

    /// End the browser session
    async fn shutdown(&mut self) -> E2eResult<()>;
}

/// Starts browser processes and contexts
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Start the driver process, if this backend needs one
    async fn start_process(&self, config: &BrowserConfig) -> E2eResult<Option<DriverProcess>>;

    /// Create the isolated browser context
    async fn connect(
        &self,
        config: &BrowserConfig,
        process: Option<&DriverProcess>,
    ) -> E2eResult<Box<dyn BrowserDriver>>;
}
