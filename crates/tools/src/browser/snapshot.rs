//! Interactive element snapshot.
//!
//! An injected script collects every visible, clickable element on the page
//! as a raw record; [`filter_and_order`] then cleans the list and puts it in
//! reading order. The index each record ends up with is its visual position,
//! which the resolver uses to break score ties.

use paynav_core::{Result, SnapshotConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use tracing::debug;

use super::page::Page;

/// Collects candidate elements. Returns an array of raw records.
pub const SNAPSHOT_JS: &str = r#"(() => {
  const selector = [
    'a[href]', 'button', 'input[type=button]', 'input[type=submit]',
    '[role=button]', '[role=link]', '[role=menuitem]', '[role=tab]',
    '[tabindex]', '[onclick]'
  ].join(',');
  const out = [];
  for (const el of document.querySelectorAll(selector)) {
    const tag = el.tagName.toLowerCase();
    if ((tag === 'button' || tag === 'input') && el.disabled) continue;
    if (el.getAttribute('aria-disabled') === 'true') continue;
    const rawHref = el.getAttribute('href');
    if (tag === 'a') {
      const h = (rawHref || '').trim();
      if (!h || h.startsWith('#') || h.toLowerCase().startsWith('javascript:')) {
        if (!el.getAttribute('role') && !el.hasAttribute('onclick')) continue;
      }
    }
    const tabindex = el.getAttribute('tabindex');
    if (tabindex !== null && parseInt(tabindex, 10) < 0 && tag !== 'a' && tag !== 'button') continue;
    const style = window.getComputedStyle(el);
    const rect = el.getBoundingClientRect();
    const visible = rect.width > 0 && rect.height > 0 &&
      style.display !== 'none' && style.visibility !== 'hidden' &&
      parseFloat(style.opacity || '1') > 0;
    if (!visible) continue;
    const text = (el.innerText || el.value || el.getAttribute('aria-label') || el.title || '');
    out.push({
      text: text,
      tag: tag,
      inputType: tag === 'input' ? (el.type || '') : null,
      href: tag === 'a' && rawHref ? el.href : null,
      role: el.getAttribute('role'),
      className: typeof el.className === 'string' ? el.className : null,
      x: rect.left + window.scrollX,
      y: rect.top + window.scrollY,
      width: rect.width,
      height: rect.height,
      visible: visible
    });
  }
  return out;
})()"#;

/// Element record as produced by [`SNAPSHOT_JS`], before filtering.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawElement {
    pub text: String,
    pub tag: String,
    pub input_type: Option<String>,
    pub href: Option<String>,
    pub role: Option<String>,
    pub class_name: Option<String>,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub visible: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TagKind {
    Link,
    Button,
    GenericClickable,
}

impl TagKind {
    fn of(raw: &RawElement) -> Self {
        let role = raw.role.as_deref().unwrap_or_default();
        match raw.tag.as_str() {
            "a" if raw.href.is_some() => Self::Link,
            "button" => Self::Button,
            "input" => Self::Button,
            _ if role == "link" => Self::Link,
            _ if role == "button" => Self::Button,
            _ => Self::GenericClickable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementRecord {
    /// Position in reading order.
    pub index: usize,
    pub text: String,
    pub tag_kind: TagKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class_hint: Option<String>,
    pub bounding_box: BoundingBox,
    pub visible: bool,
}

impl ElementRecord {
    pub fn is_link_with_href(&self) -> bool {
        self.tag_kind == TagKind::Link && self.href.as_deref().is_some_and(|h| !h.is_empty())
    }
}

const CODE_MARKERS: &[&str] = &["{", "}", "function", "var ", "=>"];

/// Collapse runs of whitespace into single spaces.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn looks_like_code(text: &str) -> bool {
    CODE_MARKERS.iter().any(|m| text.contains(m))
}

fn class_hint(class_name: Option<&str>) -> Option<String> {
    let first = class_name?.split_whitespace().next()?;
    Some(first.chars().take(40).collect())
}

/// Filter raw records and order them top-to-bottom, left-to-right.
pub fn filter_and_order(raw: Vec<RawElement>, config: &SnapshotConfig) -> Vec<ElementRecord> {
    let mut seen = HashSet::new();
    let mut kept: Vec<ElementRecord> = Vec::new();

    for el in raw {
        if !el.visible || el.width <= 0.0 || el.height <= 0.0 {
            continue;
        }
        let text = normalize_text(&el.text);
        if text.is_empty() || text.chars().count() > config.max_text_len || looks_like_code(&text) {
            continue;
        }
        if !seen.insert((text.to_lowercase(), el.href.clone())) {
            continue;
        }
        kept.push(ElementRecord {
            index: 0,
            tag_kind: TagKind::of(&el),
            text,
            href: el.href.clone(),
            role: el.role.clone().filter(|r| !r.is_empty()),
            class_hint: class_hint(el.class_name.as_deref()),
            bounding_box: BoundingBox {
                x: el.x,
                y: el.y,
                width: el.width,
                height: el.height,
            },
            visible: true,
        });
    }

    let mut ordered = reading_order(kept, config.row_threshold_px);
    ordered.truncate(config.max_elements);
    for (i, el) in ordered.iter_mut().enumerate() {
        el.index = i;
    }
    ordered
}

/// Group into rows (a row starts at its top-most element and takes everything
/// within `threshold` pixels below it), then sort each row left-to-right.
fn reading_order(mut elements: Vec<ElementRecord>, threshold: f64) -> Vec<ElementRecord> {
    elements.sort_by(|a, b| {
        a.bounding_box
            .y
            .total_cmp(&b.bounding_box.y)
            .then(a.bounding_box.x.total_cmp(&b.bounding_box.x))
    });

    let mut rows: Vec<Vec<ElementRecord>> = Vec::new();
    let mut row_top = f64::NEG_INFINITY;
    for el in elements {
        match rows.last_mut() {
            Some(row) if el.bounding_box.y - row_top < threshold => row.push(el),
            _ => {
                row_top = el.bounding_box.y;
                rows.push(vec![el]);
            }
        }
    }

    rows.into_iter()
        .flat_map(|mut row| {
            row.sort_by(|a, b| a.bounding_box.x.total_cmp(&b.bounding_box.x));
            row
        })
        .collect()
}

/// Take a fresh snapshot of the page.
pub async fn capture(page: &dyn Page, config: &SnapshotConfig) -> Result<Vec<ElementRecord>> {
    let value = page.evaluate(SNAPSHOT_JS).await?;
    let raw: Vec<RawElement> = match value {
        Value::Array(_) => serde_json::from_value(value)?,
        _ => Vec::new(),
    };
    let total = raw.len();
    let elements = filter_and_order(raw, config);
    debug!(raw = total, kept = elements.len(), "Captured DOM snapshot");
    Ok(elements)
}
