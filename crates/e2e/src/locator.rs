//! Declarative element locators and their resolution
//!
//! A [`Locator`] is a lookup recipe, never a handle. Resolution runs against
//! the live DOM every time it is asked for.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::driver::ElementHandle;
use crate::error::{E2eError, E2eResult};
use crate::session::Session;
use crate::wait::Poller;

/// How to find an element
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum By {
    /// ARIA role, optionally narrowed by accessible name
    Role {
        role: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    /// Visible text content
    Text {
        text: String,
        #[serde(default)]
        exact: bool,
    },
    /// Structural path from the document root
    Path { xpath: String },
}

/// A lookup recipe plus match selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Locator {
    #[serde(flatten)]
    pub by: By,

    /// Pick the n-th match instead of requiring a unique one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nth: Option<usize>,

    /// Only search frames whose name matches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame: Option<String>,
}

impl Locator {
    pub fn role(role: impl Into<String>, name: Option<&str>) -> Self {
        Self::from(By::Role {
            role: role.into(),
            name: name.map(String::from),
        })
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::from(By::Text {
            text: text.into(),
            exact: false,
        })
    }

    pub fn xpath(xpath: impl Into<String>) -> Self {
        Self::from(By::Path { xpath: xpath.into() })
    }

    pub fn nth(mut self, index: usize) -> Self {
        self.nth = Some(index);
        self
    }

    pub fn in_frame(mut self, name: impl Into<String>) -> Self {
        self.frame = Some(name.into());
        self
    }

    /// Apply `nth` to a full match list
    pub fn select(&self, mut matches: Vec<ElementHandle>) -> Vec<ElementHandle> {
        match self.nth {
            Some(n) if n < matches.len() => vec![matches.swap_remove(n)],
            Some(_) => Vec::new(),
            None => matches,
        }
    }
}

impl From<By> for Locator {
    fn from(by: By) -> Self {
        Self {
            by,
            nth: None,
            frame: None,
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.by {
            By::Role { role, name: Some(name) } => write!(f, "role={} name={:?}", role, name)?,
            By::Role { role, name: None } => write!(f, "role={}", role)?,
            By::Text { text, exact: true } => write!(f, "text={:?} (exact)", text)?,
            By::Text { text, .. } => write!(f, "text={:?}", text)?,
            By::Path { xpath } => write!(f, "xpath={}", xpath)?,
        }
        if let Some(n) = self.nth {
            write!(f, " nth={}", n)?;
        }
        if let Some(frame) = &self.frame {
            write!(f, " frame={}", frame)?;
        }
        Ok(())
    }
}

/// Which page of the session a step targets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PageTarget {
    /// Most recently opened page
    #[default]
    Current,
    /// Page by open order
    Index(usize),
}

impl From<Option<usize>> for PageTarget {
    fn from(index: Option<usize>) -> Self {
        index.map(PageTarget::Index).unwrap_or_default()
    }
}

/// Resolve a locator against the current DOM. No caching, no waiting.
pub async fn resolve(
    session: &mut Session,
    locator: &Locator,
    target: PageTarget,
) -> E2eResult<Vec<ElementHandle>> {
    let page = session.page(target)?;
    let frames = session.frames(&page).await?;
    let driver = session.driver()?;

    let mut matches = Vec::new();
    for info in frames {
        if let Some(wanted) = &locator.frame {
            if info.name.as_deref() != Some(wanted.as_str()) {
                continue;
            }
        }
        match driver.find_all(&page, &info.frame, &locator.by).await {
            Ok(found) => matches.extend(found),
            Err(e) if info.frame.is_main() => return Err(e),
            Err(e) => {
                // Frame went away between enumeration and query
                debug!("Skipping frame {} while resolving {}: {}", info.frame, locator, e);
            }
        }
    }

    Ok(locator.select(matches))
}

/// Resolve, polling until at least one match exists or the deadline passes
pub async fn locate(
    session: &mut Session,
    locator: &Locator,
    target: PageTarget,
    timeout: Duration,
    poll_interval: Duration,
) -> E2eResult<Vec<ElementHandle>> {
    let mut poller = Poller::new(timeout, poll_interval);
    loop {
        match resolve(session, locator, target).await {
            Ok(found) if !found.is_empty() => return Ok(found),
            Ok(_) => {}
            Err(e) if e.is_transient() => debug!("Resolving {} failed, polling again: {}", locator, e),
            Err(e) => return Err(e),
        }
        if poller.tick().await.is_err() {
            return Err(E2eError::NotFound {
                locator: locator.to_string(),
                observed: format!("no match after {} ms", poller.elapsed().as_millis()),
            });
        }
    }
}

/// Compile a locator to an XPath expression
pub fn to_xpath(by: &By) -> String {
    match by {
        By::Path { xpath } => normalize_path(xpath),
        By::Text { text, exact } => {
            let literal = xpath_literal(text);
            let test = if *exact {
                format!("normalize-space(.)={}", literal)
            } else {
                format!("contains(normalize-space(.),{})", literal)
            };
            // innermost elements only
            format!("//*[{test} and not(.//*[{test}])]", test = test)
        }
        By::Role { role, name } => {
            let base = role_xpath(role);
            match name {
                None => base,
                Some(name) => {
                    let literal = xpath_literal(name);
                    let named = format!(
                        "[normalize-space(.)={l} or @aria-label={l} or @placeholder={l} or @value={l} or @title={l}]",
                        l = literal
                    );
                    base.split(" | ")
                        .map(|alt| format!("{}{}", alt, named))
                        .collect::<Vec<_>>()
                        .join(" | ")
                }
            }
        }
    }
}

/// Recorded paths come as `html/body/...` or `xpath=...`; make them absolute
fn normalize_path(xpath: &str) -> String {
    let path = xpath.strip_prefix("xpath=").unwrap_or(xpath).trim();
    if path.starts_with('/') || path.starts_with('(') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

fn role_xpath(role: &str) -> String {
    let explicit = format!("//*[@role={}]", xpath_literal(role));
    let implicit: &[&str] = match role {
        "button" => &[
            "//button",
            "//input[@type='submit' or @type='button' or @type='reset']",
        ],
        "link" => &["//a[@href]"],
        "textbox" => &[
            "//textarea",
            "//input[not(@type) or @type='text' or @type='email' or @type='password' or @type='search' or @type='tel' or @type='url' or @type='number']",
        ],
        "checkbox" => &["//input[@type='checkbox']"],
        "radio" => &["//input[@type='radio']"],
        "combobox" => &["//select"],
        "heading" => &["//h1", "//h2", "//h3", "//h4", "//h5", "//h6"],
        "listitem" => &["//li"],
        "row" => &["//tr"],
        "cell" => &["//td"],
        "dialog" => &["//dialog"],
        "navigation" => &["//nav"],
        "img" => &["//img[@alt]"],
        _ => &[],
    };

    let mut alternatives = vec![explicit];
    alternatives.extend(implicit.iter().map(|s| s.to_string()));
    alternatives.join(" | ")
}

/// Quote a string as an XPath 1.0 literal
pub fn xpath_literal(s: &str) -> String {
    if !s.contains('\'') {
        format!("'{}'", s)
    } else if !s.contains('"') {
        format!("\"{}\"", s)
    } else {
        let parts: Vec<String> = s.split('\'').map(|p| format!("'{}'", p)).collect();
        format!("concat({})", parts.join(", \"'\", "))
    }
}
