//! Inline formatting for message bodies.
//!
//! A fixed one-pass grammar: `**bold**`, `*italic*` and `[text](url)`.
//! Markers are matched leftmost-first and never nest; the inside of a
//! matched span is plain text. There is no escape syntax, so a lone `*` or
//! `[` without its closing marker stays literal.

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Span {
    Plain { text: String },
    Bold { text: String },
    Italic { text: String },
    Link { text: String, url: String },
}

pub fn render_text(body: &str) -> Vec<Span> {
    let mut spans = Vec::new();
    let mut plain = String::new();
    let mut i = 0;

    while i < body.len() {
        let rest = &body[i..];
        let matched = if rest.starts_with("**") {
            delimited(rest, "**")
                .map(|(inner, used)| (Span::Bold { text: inner.into() }, used))
                .or_else(|| italic(rest))
        } else if rest.starts_with('*') {
            italic(rest)
        } else if rest.starts_with('[') {
            link(rest)
        } else {
            None
        };

        match matched {
            Some((span, used)) => {
                if !plain.is_empty() {
                    spans.push(Span::Plain {
                        text: std::mem::take(&mut plain),
                    });
                }
                spans.push(span);
                i += used;
            }
            None => {
                let ch = rest.chars().next().unwrap_or_default();
                plain.push(ch);
                i += ch.len_utf8();
            }
        }
    }
    if !plain.is_empty() {
        spans.push(Span::Plain { text: plain });
    }
    spans
}

/// `marker inner marker` at the start of `rest`; returns the inner text and
/// the number of bytes consumed.
fn delimited<'a>(rest: &'a str, marker: &str) -> Option<(&'a str, usize)> {
    let after = &rest[marker.len()..];
    let end = after.find(marker)?;
    let inner = &after[..end];
    if inner.trim().is_empty() {
        return None;
    }
    Some((inner, marker.len() * 2 + end))
}

fn italic(rest: &str) -> Option<(Span, usize)> {
    delimited(rest, "*").map(|(inner, used)| (Span::Italic { text: inner.into() }, used))
}

fn link(rest: &str) -> Option<(Span, usize)> {
    let close = rest.find("](")?;
    let text = &rest[1..close];
    let after = &rest[close + 2..];
    let end = after.find(')')?;
    let url = &after[..end];
    if text.is_empty() || url.chars().any(char::is_whitespace) || !safe_scheme(url) {
        return None;
    }
    let used = close + 2 + end + 1;
    Some((
        Span::Link {
            text: text.to_string(),
            url: url.to_string(),
        },
        used,
    ))
}

fn safe_scheme(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://") || lower.starts_with("mailto:")
}

pub fn to_html(spans: &[Span]) -> String {
    let mut out = String::new();
    for span in spans {
        match span {
            Span::Plain { text } => out.push_str(&escape(text)),
            Span::Bold { text } => {
                out.push_str("<strong>");
                out.push_str(&escape(text));
                out.push_str("</strong>");
            }
            Span::Italic { text } => {
                out.push_str("<em>");
                out.push_str(&escape(text));
                out.push_str("</em>");
            }
            Span::Link { text, url } => {
                out.push_str(&format!(
                    "<a href=\"{}\" target=\"_blank\" rel=\"noopener noreferrer\">{}</a>",
                    escape(url),
                    escape(text)
                ));
            }
        }
    }
    out
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain(text: &str) -> Span {
        Span::Plain { text: text.into() }
    }

    #[test]
    fn test_plain_text_is_one_span() {
        assert_eq!(render_text("hello there"), vec![plain("hello there")]);
        assert!(render_text("").is_empty());
    }

    #[test]
    fn test_bold_italic_link() {
        let spans = render_text("a **b** *c* [d](https://e.example)");
        assert_eq!(
            spans,
            vec![
                plain("a "),
                Span::Bold { text: "b".into() },
                plain(" "),
                Span::Italic { text: "c".into() },
                plain(" "),
                Span::Link {
                    text: "d".into(),
                    url: "https://e.example".into()
                },
            ]
        );
    }

    #[test]
    fn test_unclosed_markers_stay_literal() {
        assert_eq!(render_text("2 * 3 = 6"), vec![plain("2 * 3 = 6")]);
        assert_eq!(render_text("[not a link"), vec![plain("[not a link")]);
        assert_eq!(render_text("** **"), vec![plain("** **")]);
    }

    #[test]
    fn test_no_nesting() {
        assert_eq!(
            render_text("**[x](https://y)**"),
            vec![Span::Bold {
                text: "[x](https://y)".into()
            }]
        );
    }

    #[test]
    fn test_leftmost_match_wins() {
        // the italic opened first swallows the would-be bold opener
        assert_eq!(
            render_text("*a **b*"),
            vec![
                Span::Italic { text: "a ".into() },
                Span::Italic { text: "b".into() },
            ]
        );
    }

    #[test]
    fn test_unclosed_bold_falls_back_to_italic() {
        assert_eq!(
            render_text("**a* b"),
            vec![plain("*"), Span::Italic { text: "a".into() }, plain(" b")]
        );
    }

    #[test]
    fn test_unsafe_link_scheme_is_plain() {
        assert_eq!(
            render_text("[x](javascript:alert(1))"),
            vec![plain("[x](javascript:alert(1))")]
        );
    }

    #[test]
    fn test_multibyte_text() {
        assert_eq!(
            render_text("héllo **wörld**"),
            vec![plain("héllo "), Span::Bold { text: "wörld".into() }]
        );
    }

    #[test]
    fn test_html_escapes() {
        let html = to_html(&render_text("<b> **x&y** [l](https://a.b/?q=\"1\")"));
        assert_eq!(
            html,
            "&lt;b&gt; <strong>x&amp;y</strong> <a href=\"https://a.b/?q=&quot;1&quot;\" \
             target=\"_blank\" rel=\"noopener noreferrer\">l</a>"
        );
    }
}
