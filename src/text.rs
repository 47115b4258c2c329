use std::sync::LazyLock;

use regex::{Captures, Regex};

static BREAK_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)<br\s*/?>").unwrap());
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").unwrap());
static ENTITY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"&(amp|lt|gt|quot|#39);").unwrap());
static TRAILING_WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\S\n]+\n").unwrap());
static BLANKS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());

/// Turn an HTML-ish description into plain text.
///
/// `<br>` variants become newlines, every other tag is dropped, the five
/// common entities are decoded, whitespace hanging before a newline is
/// removed and runs of blank lines shrink to a single paragraph break.
/// Absent input yields an empty string.
pub fn normalize(raw: Option<&str>) -> String {
    let text = match raw {
        Some(t) if !t.is_empty() => t,
        _ => return String::new(),
    };

    let text = BREAK_RE.replace_all(text, "\n");
    let text = TAG_RE.replace_all(&text, "");
    let text = decode_entities(&text);
    let text = TRAILING_WS_RE.replace_all(&text, "\n");
    let text = BLANKS_RE.replace_all(&text, "\n\n");
    text.trim().to_string()
}

/// Single pass over the input, so `&amp;lt;` decodes to `&lt;` and stops there.
fn decode_entities(s: &str) -> String {
    ENTITY_RE
        .replace_all(s, |caps: &Captures| match &caps[1] {
            "amp" => "&",
            "lt" => "<",
            "gt" => ">",
            "quot" => "\"",
            _ => "'",
        })
        .into_owned()
}
