//! Main-content extraction from HTML pages.
//!
//! Pages are parsed with `scraper` (html5ever), so attribute values,
//! entities, comments and raw-text elements follow the HTML parsing rules.
//! On top of the parsed tree:
//!
//! - boilerplate subtrees (`nav`, `header`, `footer`, `aside`, `form`,
//!   `noscript`, `svg`, `iframe`) and `script` / `style` / `template`
//!   bodies are dropped;
//! - text inside `<main>` / `<article>` is preferred when the page has any;
//! - block-level elements become line breaks.

use scraper::{ElementRef, Html, Node};

/// Text extracted from one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedPage {
    pub title: Option<String>,
    pub text: String,
}

const SKIPPED_TAGS: &[&str] = &[
    "head", "script", "style", "template", "nav", "header", "footer", "aside", "form", "noscript",
    "svg", "iframe",
];

const MAIN_TAGS: &[&str] = &["main", "article"];

const BLOCK_TAGS: &[&str] = &[
    "p", "br", "div", "section", "main", "article", "li", "ul", "ol", "tr", "td", "th", "table",
    "h1", "h2", "h3", "h4", "h5", "h6", "blockquote", "pre", "dd", "dt", "hr",
];

pub fn extract_main_text(html: &str) -> ExtractedPage {
    let document = Html::parse_document(html);
    let root = document.root_element();

    let title = root
        .descendants()
        .filter_map(ElementRef::wrap)
        .find(|e| e.value().name() == "title")
        .map(|e| collapse_spaces(&e.text().collect::<String>()))
        .filter(|t| !t.is_empty());

    // Outermost main/article elements that are not themselves boilerplate.
    let main: Vec<ElementRef<'_>> = root
        .descendants()
        .filter_map(ElementRef::wrap)
        .filter(|e| MAIN_TAGS.contains(&e.value().name()))
        .filter(|e| {
            !e.ancestors().filter_map(ElementRef::wrap).any(|a| {
                let name = a.value().name();
                MAIN_TAGS.contains(&name) || SKIPPED_TAGS.contains(&name)
            })
        })
        .collect();

    let mut text = String::new();
    if main.is_empty() {
        collect_text(root, &mut text);
    } else {
        for element in main {
            text.push('\n');
            collect_text(element, &mut text);
        }
    }

    ExtractedPage {
        title,
        text: tidy_lines(&text),
    }
}

fn collect_text(element: ElementRef<'_>, out: &mut String) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => out.push_str(text),
            Node::Element(_) => {
                let Some(child) = ElementRef::wrap(child) else {
                    continue;
                };
                let name = child.value().name();
                if SKIPPED_TAGS.contains(&name) {
                    continue;
                }
                let block = BLOCK_TAGS.contains(&name);
                if block {
                    out.push('\n');
                }
                collect_text(child, out);
                if block {
                    out.push('\n');
                }
            }
            _ => {}
        }
    }
}

fn collapse_spaces(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn tidy_lines(s: &str) -> String {
    s.lines()
        .map(collapse_spaces)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
