use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::errors::BrowserError;
use crate::hands::PageHandle;
use crate::types::{
    ELEMENT_CLASS_PREFIX, ElementAttributes, ElementDescriptor, ID_ATTRIBUTE, LiveIdentifierSet,
    MAX_CANDIDATES,
};

pub(crate) const PROBE_MARKER: &str = "/* nav:probe */";
pub(crate) const STAMP_MARKER: &str = "/* nav:stamp */";

pub(crate) const BODY_HTML_JS: &str = "document.body.innerHTML";
pub(crate) const TITLE_JS: &str = "document.title";

/// Interactive elements a user could reach by keyboard or click.
const CANDIDATE_SELECTOR: &str = concat!(
    "input:not([type=hidden]):not([disabled]), ",
    "textarea:not([disabled]), ",
    "button:not([disabled]), ",
    r#"[tabindex]:not([tabindex="-1"]), "#,
    "select:not([disabled]), ",
    r##"a[href]:not([href="javascript:void(0)"]):not([href="#"]), "##,
    "dialog[open]",
);

/// Clip rects used by "visually hidden" utility classes.
const HIDDEN_CLIPS: [&str; 2] = ["rect(1px,1px,1px,1px)", "rect(0px,0px,0px,0px)"];

/// JavaScript injected to enumerate candidates.
/// Clears stamps from any previous pass, marks each candidate with its
/// sequence number and reports the raw facts the filters below need.
/// A candidate that throws while being read is reported as `null`.
const PROBE_JS: &str = r#"
(() => {
  const MAX = __MAX__;
  const FILTER = __FILTER__;
  const PREFIX = __PREFIX__;
  const ID_ATTR = __ID_ATTR__;

  for (const el of document.querySelectorAll('[' + ID_ATTR + ']')) {
    el.removeAttribute(ID_ATTR);
    el.style.outline = '';
  }
  for (const el of document.querySelectorAll('[class*="' + PREFIX + '"]')) {
    [...el.classList].filter(c => c.startsWith(PREFIX)).forEach(c => el.classList.remove(c));
  }
  for (const el of document.querySelectorAll('[data-nav-candidate]')) {
    el.removeAttribute('data-nav-candidate');
  }

  const out = [];
  let seq = 0;
  for (const el of document.querySelectorAll(__CANDIDATES__)) {
    if (seq >= MAX) break;
    seq += 1;
    try {
      if (!el.matches(FILTER)) { out.push(null); continue; }
      el.setAttribute('data-nav-candidate', String(seq));
      const style = getComputedStyle(el);
      const rect = el.getBoundingClientRect();
      const str = v => (typeof v === 'string' && v !== '') ? v : null;
      out.push({
        seq,
        tag: el.tagName.toLowerCase(),
        text: (el.textContent || '').replace(/\s+/g, ' ').trim(),
        form_control: el.matches('select, input, textarea'),
        role: str(el.getAttribute('role')),
        placeholder: str(el.getAttribute('placeholder')),
        title: str(el.getAttribute('title')),
        type: str(el.type),
        href: str(el.href),
        value: str(el.value),
        display: style.display,
        visibility: style.visibility,
        clip: style.clip,
        width: rect.width,
        height: rect.height,
      });
    } catch (e) {
      out.push(null);
    }
  }
  return JSON.stringify(out);
})()
"#;

/// Stamps surviving candidates: per-step class first, then the lookup
/// attribute and a debug outline (outline does not affect layout).
const STAMP_JS: &str = r#"
(() => {
  const IDS = __IDS__;
  const PREFIX = __PREFIX__;
  const ID_ATTR = __ID_ATTR__;
  const stamped = [];
  for (const id of IDS) {
    try {
      const candidate = document.querySelector('[data-nav-candidate="' + id + '"]');
      if (!candidate) continue;
      candidate.classList.add(PREFIX + id);
      const el = document.querySelector('.' + PREFIX + id);
      el.setAttribute(ID_ATTR, id);
      el.style.outline = '1px solid red';
      stamped.push(id);
    } catch (e) {}
  }
  for (const el of document.querySelectorAll('[data-nav-candidate]')) {
    el.removeAttribute('data-nav-candidate');
  }
  return JSON.stringify(stamped);
})()
"#;

/// Tuning for one extraction pass.
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub max_candidates: usize,
    /// Extra selector every candidate must also match.
    pub filter: String,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            max_candidates: MAX_CANDIDATES,
            filter: "*".to_string(),
        }
    }
}

/// Facts reported by the probe for one candidate.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RawCandidate {
    pub seq: usize,
    pub tag: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub form_control: bool,
    pub role: Option<String>,
    pub placeholder: Option<String>,
    pub title: Option<String>,
    #[serde(rename = "type")]
    pub input_type: Option<String>,
    pub href: Option<String>,
    pub value: Option<String>,
    #[serde(default)]
    pub display: String,
    #[serde(default)]
    pub visibility: String,
    #[serde(default)]
    pub clip: String,
    #[serde(default)]
    pub width: f64,
    #[serde(default)]
    pub height: f64,
}

impl RawCandidate {
    /// Body never counts; unlabelled non-form elements give the model nothing.
    fn is_tabbable(&self) -> bool {
        if self.tag.eq_ignore_ascii_case("body") {
            return false;
        }
        !(self.text.trim().is_empty() && !self.form_control)
    }

    fn is_visible(&self) -> bool {
        let clip: String = self.clip.chars().filter(|c| !c.is_whitespace()).collect();
        self.display != "none"
            && self.visibility != "hidden"
            && self.width != 0.0
            && self.height != 0.0
            && !HIDDEN_CLIPS.contains(&clip.as_str())
    }

    fn into_descriptor(self) -> ElementDescriptor {
        let attributes = ElementAttributes {
            role: self.role,
            placeholder: self.placeholder,
            title: self.title,
            input_type: self.input_type,
            href: self.href,
            value: self.value,
        };
        ElementDescriptor::new(self.seq.to_string(), &self.tag, attributes, &self.text)
    }
}

fn js_string(value: &str) -> String {
    Value::String(value.to_string()).to_string()
}

pub(crate) fn probe_script(options: &ExtractOptions) -> String {
    let script = PROBE_JS
        .replace("__MAX__", &options.max_candidates.to_string())
        .replace("__FILTER__", &js_string(&options.filter))
        .replace("__PREFIX__", &js_string(ELEMENT_CLASS_PREFIX))
        .replace("__ID_ATTR__", &js_string(ID_ATTRIBUTE))
        .replace("__CANDIDATES__", &js_string(CANDIDATE_SELECTOR));
    format!("{PROBE_MARKER}{script}")
}

pub(crate) fn stamp_script(ids: &[String]) -> String {
    let script = STAMP_JS
        .replace("__IDS__", &Value::from(ids.to_vec()).to_string())
        .replace("__PREFIX__", &js_string(ELEMENT_CLASS_PREFIX))
        .replace("__ID_ATTR__", &js_string(ID_ATTRIBUTE));
    format!("{STAMP_MARKER}{script}")
}

/// CSS selector resolving an identifier back to its live element.
pub fn selector_for(identifier: &str) -> String {
    format!("[{ID_ATTRIBUTE}={}]", js_string(identifier))
}

/// Evaluate a script that returns a string.
pub(crate) async fn evaluate_string(
    page: &dyn PageHandle,
    script: &str,
) -> Result<String, BrowserError> {
    match page.evaluate(script).await? {
        Value::String(s) => Ok(s),
        Value::Null => Ok(String::new()),
        other => Err(BrowserError::Evaluation(format!(
            "expected a string result, got {other}"
        ))),
    }
}

/// Parse probe output, dropping entries that are null or malformed.
pub(crate) fn parse_candidates(json: &str) -> Result<Vec<RawCandidate>, BrowserError> {
    let entries: Vec<Value> = serde_json::from_str(json)
        .map_err(|e| BrowserError::Evaluation(format!("probe parse error: {e}")))?;
    Ok(entries
        .into_iter()
        .filter(|v| !v.is_null())
        .filter_map(|v| match serde_json::from_value::<RawCandidate>(v) {
            Ok(c) => Some(c),
            Err(e) => {
                debug!(target: "dom", error = %e, "skipping unreadable candidate");
                None
            }
        })
        .collect())
}

/// Apply the exclusion and visibility rules, keeping document order.
pub(crate) fn select_candidates(raw: Vec<RawCandidate>) -> Vec<RawCandidate> {
    raw.into_iter()
        .filter(|c| c.is_tabbable() && c.is_visible())
        .collect()
}

/// Find, filter and stamp the interactive elements on `page`.
///
/// Per-element problems only exclude that element. Failing to query the
/// document at all is returned to the caller.
pub async fn extract_elements(
    page: &dyn PageHandle,
    options: &ExtractOptions,
) -> Result<(Vec<ElementDescriptor>, LiveIdentifierSet), BrowserError> {
    let raw = parse_candidates(&evaluate_string(page, &probe_script(options)).await?)?;
    let probed = raw.len();
    let survivors = select_candidates(raw);

    let wanted: Vec<String> = survivors.iter().map(|c| c.seq.to_string()).collect();
    let stamped: Vec<String> = if wanted.is_empty() {
        Vec::new()
    } else {
        let json = evaluate_string(page, &stamp_script(&wanted)).await?;
        serde_json::from_str(&json)
            .map_err(|e| BrowserError::Evaluation(format!("stamp parse error: {e}")))?
    };

    let descriptors: Vec<ElementDescriptor> = survivors
        .into_iter()
        .filter(|c| stamped.contains(&c.seq.to_string()))
        .map(RawCandidate::into_descriptor)
        .collect();
    let live = LiveIdentifierSet::new(descriptors.iter().map(|d| d.identifier.clone()).collect());

    debug!(
        target: "dom",
        probed,
        tagged = live.len(),
        "extracted interactive elements"
    );
    Ok((descriptors, live))
}
