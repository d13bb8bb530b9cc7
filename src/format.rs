#![forbid(unsafe_code)]

//! Display formatting for the detail fields returned by the `videos` endpoint
//! plus the small HTML helpers shared by record and feed rendering.
//!
//! Every function here is total: bad input degrades to `None` (or an empty
//! string) instead of an error.

use std::sync::LazyLock;

use regex::Regex;

static DURATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^PT(?:(\d+)H)?(?:(\d+)M)?(?:(\d+)S)?").expect("duration pattern compiles")
});

/// Turns an ISO-8601 duration such as `PT1H2M3S` into `01:02:03`.
///
/// The hour group is only rendered when it is non-zero, so `PT1M5S` becomes
/// `01:05`. Missing components count as zero.
pub fn parse_duration(value: &str) -> Option<String> {
    if value.is_empty() {
        return None;
    }
    let captures = DURATION_RE.captures(value)?;
    let component = |index: usize| -> u64 {
        captures
            .get(index)
            .and_then(|m| m.as_str().parse::<u64>().ok())
            .unwrap_or(0)
    };
    let (hours, minutes, seconds) = (component(1), component(2), component(3));
    let hour_part = if hours > 0 {
        format!("{hours:02}:")
    } else {
        String::new()
    };
    Some(format!("{hour_part}{minutes:02}:{seconds:02}"))
}

pub fn format_definition(value: &str) -> Option<String> {
    if value.is_empty() {
        return None;
    }
    Some(value.to_uppercase())
}

/// Groups thousands with `.` and drops decimals: `1200` renders as `1.200`.
/// Zero is treated as "no value".
pub fn format_view_count(value: u64) -> Option<String> {
    if value == 0 {
        return None;
    }
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (index, ch) in digits.chars().enumerate() {
        if index > 0 && (digits.len() - index) % 3 == 0 {
            out.push('.');
        }
        out.push(ch);
    }
    Some(out)
}

/// The API reports counts as decimal strings.
pub fn parse_view_count(raw: &str) -> Option<String> {
    raw.trim().parse::<u64>().ok().and_then(format_view_count)
}

pub fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#039;"),
            other => out.push(other),
        }
    }
    out
}

/// Lowercase ASCII slug: runs of anything that is not a letter or digit
/// collapse into a single `-`.
pub fn slugify(value: &str) -> String {
    let mut slug = String::with_capacity(value.len());
    let mut pending_dash = false;
    for ch in value.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug
}
