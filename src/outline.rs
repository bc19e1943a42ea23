//! Flattens page HTML into the outline the model reads.
//!
//! Only elements stamped with a live identifier are rendered as tags; every
//! other element contributes its text and, for headings, forms and sectioning
//! blocks, a little structure.

use std::sync::LazyLock;

use regex::Regex;
use scraper::node::Node;
use scraper::{ElementRef, Html, Selector};

use crate::types::{ElementAttributes, ElementDescriptor, ID_ATTRIBUTE, LiveIdentifierSet};

/// Regions moved to the top of the body, processed in this order.
const IMPORTANT: [&str; 6] = [
    "main",
    r#"[role="main"]"#,
    "#bodyContent",
    "#search",
    "#searchform",
    ".kp-header",
];

const HEADINGS: [&str; 6] = ["h1", "h2", "h3", "h4", "h5", "h6"];
const BLOCKS: [&str; 3] = ["div", "section", "main"];

static INLINE_SPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\S\n]+").expect("valid inline space pattern"));
static SPACE_BEFORE_NEWLINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r" \n+").expect("valid trailing space pattern"));
static NEWLINE_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n+").expect("valid newline pattern"));

/// Full page content block sent to the model: title line plus outline.
pub fn page_content(title: &str, body_html: &str, live: &LiveIdentifierSet) -> String {
    format!(
        "## START OF PAGE CONTENT ##\nTitle: {}\n\n{}\n## END OF PAGE CONTENT ##",
        title.trim(),
        outline(body_html, live)
    )
}

/// Render `body_html` as a compact outline. Deterministic for a given
/// input and identifier set.
pub fn outline(body_html: &str, live: &LiveIdentifierSet) -> String {
    let spaced = body_html.replace("</", " </");
    let mut document = Html::parse_document(&format!("<body>{spaced}</body>"));
    strip_non_content(&mut document);
    promote_important(&mut document);

    let Ok(body_selector) = Selector::parse("body") else {
        return String::new();
    };
    let Some(body) = document.select(&body_selector).next() else {
        return String::new();
    };

    let mut out = String::new();
    traverse(body, live, &mut out);
    collapse_whitespace(&out)
}

fn strip_non_content(document: &mut Html) {
    let Ok(selector) = Selector::parse("script, style") else {
        return;
    };
    let ids: Vec<_> = document.select(&selector).map(|el| el.id()).collect();
    for id in ids {
        if let Some(mut node) = document.tree.get_mut(id) {
            node.detach();
        }
    }
}

fn promote_important(document: &mut Html) {
    let Ok(body_selector) = Selector::parse("body") else {
        return;
    };
    let Some(body_id) = document.select(&body_selector).next().map(|b| b.id()) else {
        return;
    };

    for important in IMPORTANT {
        let Ok(selector) = Selector::parse(important) else {
            continue;
        };
        let ids: Vec<_> = document
            .select(&selector)
            .filter(|el| el.ancestors().any(|a| a.id() == body_id))
            .map(|el| el.id())
            .collect();
        for id in ids {
            if let Some(mut body) = document.tree.get_mut(body_id) {
                body.prepend_id(id);
            }
        }
    }
}

fn is_live(element: ElementRef<'_>, live: &LiveIdentifierSet) -> bool {
    element
        .value()
        .attr(ID_ATTRIBUTE)
        .is_some_and(|id| live.contains(id))
}

fn render_tag(element: ElementRef<'_>) -> String {
    let el = element.value();
    let attr = |name: &str| el.attr(name).map(str::to_string);
    let attributes = ElementAttributes {
        role: attr("role"),
        placeholder: attr("placeholder"),
        title: attr("title"),
        input_type: attr("type"),
        href: attr("href"),
        value: attr("value"),
    };
    let text: String = element.text().collect();
    let identifier = el.attr(ID_ATTRIBUTE).unwrap_or_default();
    ElementDescriptor::new(identifier, el.name(), attributes, &text).render()
}

fn traverse(element: ElementRef<'_>, live: &LiveIdentifierSet, out: &mut String) {
    let name = element.value().name();
    let heading = HEADINGS.contains(&name);
    let form = name == "form";

    if heading {
        out.push_str(&format!("<{name}>"));
    }
    if form {
        out.push_str("\n<form>\n");
    }
    if BLOCKS.contains(&name) {
        out.push('\n');
    }

    let tagged = is_live(element, live);
    if tagged {
        out.push(' ');
        out.push_str(&render_tag(element));
    }

    for child in element.children() {
        match child.value() {
            // A tagged element already carries its own label.
            Node::Text(text) if !tagged => {
                out.push(' ');
                out.push_str(text.trim());
            }
            Node::Element(_) => {
                if let Some(child) = ElementRef::wrap(child) {
                    traverse(child, live, out);
                }
            }
            _ => {}
        }
    }

    if heading {
        out.push_str(&format!("</{name}>"));
    }
    if form {
        out.push_str("\n</form>\n");
    }
    if heading || BLOCKS.contains(&name) {
        out.push('\n');
    }
}

fn collapse_whitespace(raw: &str) -> String {
    let inline = INLINE_SPACE.replace_all(raw, " ");
    let trailing = SPACE_BEFORE_NEWLINE.replace_all(&inline, "\n");
    NEWLINE_RUN.replace_all(&trailing, "\n").into_owned()
}
