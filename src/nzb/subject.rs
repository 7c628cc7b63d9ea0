//! Subject line normalisation
//!
//! Usenet subjects follow loose conventions rather than a format. The
//! common shapes are variations of:
//!
//! ```text
//! Some.Movie.2024 [02/50] - "Some.Movie.2024.part02.rar" yEnc (1/137)
//! ```
//!
//! Recognised patterns (case-insensitive): a filename in double quotes, an
//! `(N/M)` or `[N/M]` volume indicator yielding the file's order number,
//! and a trailing `yEnc` marker. When nothing matches, the derived name is
//! the subject trimmed of a trailing `(N/M)` counter and the order falls
//! back to the file's document index. Parsing is deterministic and
//! idempotent: feeding a derived name back through changes nothing.

use regex::Regex;
use std::sync::LazyLock;

/// Filename in double quotes; first match wins
static QUOTED_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""([^"]+)""#).expect("static regex"));

/// `[N/M]` or `(N/M)` volume indicator; first match is the file order
static VOLUME_INDICATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\[(](\d+)\s*/\s*\d+[\])]").expect("static regex"));

/// Trailing segment counter and optional yEnc marker, stripped from
/// fallback names: `... yEnc (12/137)` or `... (12/137)`
static TRAILING_COUNTER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\s*(?:yenc\s*)?\(\d+\s*/\s*\d+\)\s*$").expect("static regex")
});

/// Result of parsing one subject line
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedSubject {
    /// Derived filename
    pub name: String,
    /// Derived order number, when the subject carried one
    pub order: Option<usize>,
}

/// Parse a subject line into a filename and an order number
pub fn parse(subject: &str) -> ParsedSubject {
    let name = QUOTED_NAME
        .captures(subject)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| fallback_name(subject));

    let order = VOLUME_INDICATOR
        .captures(subject)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok());

    ParsedSubject { name, order }
}

/// Subject trimmed of a trailing `(N/M)` counter (and yEnc marker)
fn fallback_name(subject: &str) -> String {
    TRAILING_COUNTER.replace(subject, "").trim().to_string()
}
