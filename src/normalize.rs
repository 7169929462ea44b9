//! Company-name normalization.
//!
//! The normalized form is the key for temp-ID hashing, the alias table
//! (`match_type = name`) and the enrichment index. It must therefore be
//! stable: changing these rules changes every derived ID.

use std::sync::OnceLock;

use regex::Regex;

static STATUS_MARKER: OnceLock<Regex> = OnceLock::new();
static LEGAL_SUFFIX: OnceLock<Regex> = OnceLock::new();

fn status_marker() -> &'static Regex {
    STATUS_MARKER.get_or_init(|| {
        Regex::new(
            r"\(\s*(?:已注销|注销|存续|在业|开业|已吊销|吊销,?未注销|吊销|迁出|停业|清算|撤销)\s*\)",
        )
        .unwrap_or_else(|e| panic!("status marker pattern is invalid: {e}"))
    })
}

fn legal_suffix() -> &'static Regex {
    LEGAL_SUFFIX.get_or_init(|| {
        Regex::new(
            r"(?:[\s,]+(?:co\.?,?\s*ltd\.?|company\s+limited|limited|ltd\.?|incorporated|inc\.?|llc|corporation|corp\.?))+$",
        )
        .unwrap_or_else(|e| panic!("legal suffix pattern is invalid: {e}"))
    })
}

/// Folds full-width ASCII forms and the ideographic space to their
/// half-width equivalents.
fn fold_width(c: char) -> char {
    match c {
        '\u{3000}' => ' ',
        '\u{FF01}'..='\u{FF5E}' => char::from_u32(c as u32 - 0xFEE0).unwrap_or(c),
        _ => c,
    }
}

fn is_wide(c: char) -> bool {
    !c.is_ascii()
}

/// Drops spaces that touch a non-ASCII character, so `中国 平安` and
/// `中国平安` share a key while `acme trading` keeps its word break.
fn squeeze_wide_spacing(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len());
    for (i, &c) in chars.iter().enumerate() {
        if c == ' ' {
            let prev_wide = i > 0 && is_wide(chars[i - 1]);
            let next_wide = chars.get(i + 1).is_some_and(|n| is_wide(*n));
            if prev_wide || next_wide {
                continue;
            }
        }
        out.push(c);
    }
    out
}

/// Returns true if `value` is absent or contains only whitespace.
#[must_use]
pub fn is_blank(value: Option<&str>) -> bool {
    value.map_or(true, |v| v.chars().all(|c| c.is_whitespace() || c == '\u{3000}'))
}

/// Normalizes a free-text company name.
///
/// Rules, in order: width folding, status-marker removal (`(已注销)`,
/// `（存续）`, ...), case folding, whitespace collapse, trailing English
/// legal-suffix removal, and removal of spaces adjacent to CJK text.
///
/// The function is idempotent.
///
/// # Examples
///
/// ```
/// use company_id_resolver::normalize::normalize_company_name;
///
/// assert_eq!(normalize_company_name(" 中国平安（已注销） "), "中国平安");
/// assert_eq!(normalize_company_name("ACME Trading Co., Ltd."), "acme trading");
/// ```
#[must_use]
pub fn normalize_company_name(raw: &str) -> String {
    let mut out = normalize_pass(raw);
    // Removing one marker or suffix can expose another, so repeat until the
    // name stops changing. Later passes only delete characters.
    loop {
        let next = normalize_pass(&out);
        if next == out {
            return out;
        }
        out = next;
    }
}

fn normalize_pass(raw: &str) -> String {
    let folded: String = raw.chars().map(fold_width).collect();
    let without_status = status_marker().replace_all(&folded, "");
    let lowered = without_status.to_lowercase();
    let collapsed = lowered.split_whitespace().collect::<Vec<_>>().join(" ");
    let separated = collapsed.trim_end_matches([',', ' ']);
    let without_suffix = legal_suffix().replace(separated, "");
    let trimmed = without_suffix.trim_end_matches([',', ' ']);
    squeeze_wide_spacing(trimmed).trim().to_string()
}
