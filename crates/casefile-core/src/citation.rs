//! Citation markup parsing and rendering.
//!
//! The chat model cites sources inline with two tags:
//!
//! ```text
//! <cite doc="Doc A" page="2" section="Section 3 — Rent">the rent is £12,000</cite>
//! <webcite url="https://example.com/x" title="Example">summary of the page</webcite>
//! ```
//!
//! `section` is optional. Attributes may appear in any order and use
//! single or double quotes.
//!
//! Tags are rendered into readable brackets:
//!
//! ```text
//! the rent is £12,000 [Doc A, Section 3 — Rent, p.2]
//! summary of the page [Web · Example]
//! ```
//!
//! [`render_partial`] is used while text is still streaming: a trailing
//! tag that is not yet closed (or a trailing `<cit…` that may become one)
//! is held back until it completes. [`extract`] runs once on the final
//! text and also validates each document citation against the
//! conversation's [`LabelMap`]; unresolved citations keep their quote as
//! plain prose but are left out of the structured list.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use tracing::warn;

use crate::error::Error;
use crate::models::{Citation, LabelMap};

const DOC_TAG: &str = "cite";
const WEB_TAG: &str = "webcite";

/// Result of the final citation pass.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    /// Resolved citations in order of appearance.
    pub citations: Vec<Citation>,
    /// Text with every tag rendered.
    pub cleaned: String,
    /// One entry per tag that was rendered as plain prose instead.
    pub dropped: Vec<String>,
}

/// Parse and validate citations in a complete answer.
pub fn extract(text: &str, labels: &LabelMap) -> Extraction {
    let mut out = Extraction::default();
    let scan = scan(text);

    for segment in scan.segments {
        match segment {
            Segment::Text(t) => out.cleaned.push_str(t),
            Segment::Tag(tag) => match resolve(&tag, labels) {
                Ok(citation) => {
                    out.cleaned.push_str(&render_citation(&citation));
                    out.citations.push(citation);
                }
                Err(reason) => {
                    let err = Error::CitationUnresolvable(reason);
                    warn!(error = %err, "dropping citation");
                    out.dropped.push(err.to_string());
                    out.cleaned.push_str(tag.inner.trim());
                }
            },
        }
    }

    match scan.tail {
        Tail::None => {}
        Tail::Fragment(rest) => out.cleaned.push_str(rest),
        Tail::Unclosed { inner } => {
            let err = Error::CitationUnresolvable("unterminated citation tag".to_string());
            warn!(error = %err, "dropping citation");
            out.dropped.push(err.to_string());
            out.cleaned.push_str(inner.trim());
        }
    }

    out
}

/// Render the stable prefix of text that may still be growing.
///
/// The result only ever grows as `text` grows, so callers can emit the
/// difference between successive calls as a delta.
pub fn render_partial(text: &str, labels: &LabelMap) -> String {
    let mut rendered = String::new();
    for segment in scan(text).segments {
        match segment {
            Segment::Text(t) => rendered.push_str(t),
            Segment::Tag(tag) => match resolve(&tag, labels) {
                Ok(citation) => rendered.push_str(&render_citation(&citation)),
                Err(_) => rendered.push_str(tag.inner.trim()),
            },
        }
    }
    rendered
}

/// Render tags without validating labels. Used for replaying history.
pub fn render_unchecked(text: &str) -> String {
    let scan = scan(text);
    let mut rendered = String::new();
    for segment in scan.segments {
        match segment {
            Segment::Text(t) => rendered.push_str(t),
            Segment::Tag(tag) => match parse(&tag) {
                Ok(Parsed::Doc {
                    label,
                    page,
                    section,
                    quote,
                }) => rendered.push_str(&render_doc(&quote, &label, section.as_deref(), page)),
                Ok(Parsed::Web {
                    url,
                    title,
                    summary,
                }) => rendered.push_str(&render_web(&summary, &title, &url)),
                Err(_) => rendered.push_str(tag.inner.trim()),
            },
        }
    }
    match scan.tail {
        Tail::None => {}
        Tail::Fragment(rest) => rendered.push_str(rest),
        Tail::Unclosed { inner } => rendered.push_str(inner.trim()),
    }
    rendered
}

/// Readable bracket form of a resolved citation.
pub fn render_citation(citation: &Citation) -> String {
    match citation {
        Citation::Document {
            doc_label,
            page,
            section,
            quote,
            ..
        } => render_doc(quote, doc_label, section.as_deref(), *page),
        Citation::Web {
            url,
            title,
            summary,
        } => render_web(summary, title, url),
    }
}

fn render_doc(quote: &str, label: &str, section: Option<&str>, page: u32) -> String {
    match section {
        Some(s) if !s.trim().is_empty() => format!("{} [{}, {}, p.{}]", quote, label, s, page),
        _ => format!("{} [{}, p.{}]", quote, label, page),
    }
}

fn render_web(summary: &str, title: &str, url: &str) -> String {
    let title = if title.trim().is_empty() { url } else { title };
    format!("{} [Web · {}]", summary, title)
}

// ═══════════════════════════════════════════════════════════════════════
// Scanner
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug)]
struct RawTag<'a> {
    name: &'static str,
    attrs: HashMap<String, String>,
    inner: &'a str,
}

#[derive(Debug)]
enum Segment<'a> {
    Text(&'a str),
    Tag(RawTag<'a>),
}

#[derive(Debug)]
enum Tail<'a> {
    None,
    /// A trailing `<`, `<ci`, or an opening tag still missing its `>`.
    Fragment(&'a str),
    /// A complete opening tag with no closing tag yet.
    Unclosed { inner: &'a str },
}

struct Scan<'a> {
    segments: Vec<Segment<'a>>,
    tail: Tail<'a>,
}

enum Open {
    Tag {
        name: &'static str,
        attrs_src_end: usize,
        open_len: usize,
    },
    Partial,
    NotATag,
}

fn open_at(rest: &str) -> Open {
    for name in [WEB_TAG, DOC_TAG] {
        let prefix_len = name.len() + 1;
        if rest.len() < prefix_len {
            if format!("<{}", name).starts_with(rest) {
                return Open::Partial;
            }
            continue;
        }
        if !rest.starts_with('<') || !rest[1..].starts_with(name) {
            continue;
        }
        match rest[prefix_len..].chars().next() {
            None => return Open::Partial,
            Some(c) if c.is_whitespace() || c == '>' => {
                return match tag_end(rest) {
                    Some(gt) => Open::Tag {
                        name,
                        attrs_src_end: gt,
                        open_len: gt + 1,
                    },
                    None => Open::Partial,
                };
            }
            Some(_) => continue,
        }
    }
    Open::NotATag
}

/// Byte offset of the `>` closing an opening tag. A `>` inside a quoted
/// attribute value does not count.
fn tag_end(tag: &str) -> Option<usize> {
    let mut quote: Option<u8> = None;
    for (i, b) in tag.bytes().enumerate() {
        match (quote, b) {
            (Some(q), _) if b == q => quote = None,
            (Some(_), _) => {}
            (None, b'"') | (None, b'\'') => quote = Some(b),
            (None, b'>') => return Some(i),
            (None, _) => {}
        }
    }
    None
}

fn scan(text: &str) -> Scan<'_> {
    let mut segments = Vec::new();
    let mut pos = 0;
    let mut text_start = 0;

    while let Some(rel) = text[pos..].find('<') {
        let lt = pos + rel;
        let rest = &text[lt..];
        match open_at(rest) {
            Open::Tag {
                name,
                attrs_src_end,
                open_len,
            } => {
                let close = format!("</{}>", name);
                let body = &rest[open_len..];
                if text_start < lt {
                    segments.push(Segment::Text(&text[text_start..lt]));
                }
                match body.find(&close) {
                    Some(ci) => {
                        segments.push(Segment::Tag(RawTag {
                            name,
                            attrs: parse_attrs(&rest[1 + name.len()..attrs_src_end]),
                            inner: &body[..ci],
                        }));
                        pos = lt + open_len + ci + close.len();
                        text_start = pos;
                    }
                    None => {
                        return Scan {
                            segments,
                            tail: Tail::Unclosed { inner: body },
                        };
                    }
                }
            }
            Open::Partial => {
                if text_start < lt {
                    segments.push(Segment::Text(&text[text_start..lt]));
                }
                return Scan {
                    segments,
                    tail: Tail::Fragment(rest),
                };
            }
            Open::NotATag => pos = lt + 1,
        }
    }

    if text_start < text.len() {
        segments.push(Segment::Text(&text[text_start..]));
    }
    Scan {
        segments,
        tail: Tail::None,
    }
}

fn attr_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"([A-Za-z_][\w-]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("attribute regex")
    })
}

fn parse_attrs(src: &str) -> HashMap<String, String> {
    attr_regex()
        .captures_iter(src)
        .map(|cap| {
            let value = cap
                .get(2)
                .or_else(|| cap.get(3))
                .map(|m| m.as_str())
                .unwrap_or_default();
            (cap[1].to_ascii_lowercase(), value.trim().to_string())
        })
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════
// Interpretation
// ═══════════════════════════════════════════════════════════════════════

enum Parsed {
    Doc {
        label: String,
        page: u32,
        section: Option<String>,
        quote: String,
    },
    Web {
        url: String,
        title: String,
        summary: String,
    },
}

fn parse(tag: &RawTag<'_>) -> Result<Parsed, String> {
    let inner = tag.inner.trim().to_string();
    if tag.name == WEB_TAG {
        let url = tag
            .attrs
            .get("url")
            .filter(|u| !u.is_empty())
            .ok_or_else(|| "web citation without url".to_string())?;
        return Ok(Parsed::Web {
            url: url.clone(),
            title: tag.attrs.get("title").cloned().unwrap_or_default(),
            summary: inner,
        });
    }

    let label = tag
        .attrs
        .get("doc")
        .filter(|d| !d.is_empty())
        .ok_or_else(|| "citation without doc label".to_string())?;
    let page_src = tag
        .attrs
        .get("page")
        .ok_or_else(|| format!("citation to {} without page", label))?;
    let page: u32 = page_src
        .parse()
        .map_err(|_| format!("citation to {} has invalid page {:?}", label, page_src))?;
    let section = tag
        .attrs
        .get("section")
        .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("null"))
        .cloned();

    Ok(Parsed::Doc {
        label: label.clone(),
        page,
        section,
        quote: inner,
    })
}

fn resolve(tag: &RawTag<'_>, labels: &LabelMap) -> Result<Citation, String> {
    match parse(tag)? {
        Parsed::Web {
            url,
            title,
            summary,
        } => Ok(Citation::Web {
            url,
            title,
            summary,
        }),
        Parsed::Doc {
            label,
            page,
            section,
            quote,
        } => {
            let target = labels
                .get(&label)
                .ok_or_else(|| format!("unknown document label {}", label))?;
            if page == 0 || page > target.page_count {
                return Err(format!(
                    "{} has {} pages, cited page {}",
                    label, target.page_count, page
                ));
            }
            Ok(Citation::Document {
                doc_label: label,
                document_id: target.document_id.clone(),
                page,
                section,
                quote,
            })
        }
    }
}
