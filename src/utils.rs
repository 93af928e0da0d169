use chrono::{DateTime, SecondsFormat, Utc};

pub const UNKNOWN_CAMPUS_SLUG: &str = "unknown_campus";
pub const UNKNOWN_CAMPUS_NAME: &str = "Unnamed Area";

const CAMPUS_SEPARATOR: &str = " - ";

/// Campus identity derived from a location name such as `"North Campus - Hall B"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CampusRef {
    pub slug: String,
    pub name: String,
}

/// Split a location name on the first `" - "` and derive the campus from the
/// leading part. Names without a usable campus part map to the shared
/// "unknown" campus; this never fails.
pub fn derive_campus(location_name: &str) -> CampusRef {
    let campus = location_name
        .split_once(CAMPUS_SEPARATOR)
        .map(|(head, _)| head.trim())
        .filter(|head| !head.is_empty());

    match campus {
        Some(name) => {
            let slug = slugify(name);
            if slug.is_empty() {
                unknown_campus()
            } else {
                CampusRef {
                    slug,
                    name: name.to_string(),
                }
            }
        }
        None => unknown_campus(),
    }
}

fn unknown_campus() -> CampusRef {
    CampusRef {
        slug: UNKNOWN_CAMPUS_SLUG.to_string(),
        name: UNKNOWN_CAMPUS_NAME.to_string(),
    }
}

/// Lowercase, collapse every run of non-alphanumerics into one `_`, trim `_`.
pub fn slugify(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut pending_sep = false;
    for ch in s.chars() {
        if ch.is_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.extend(ch.to_lowercase());
        } else {
            pending_sep = true;
        }
    }
    out
}

/// Keep at most `max` characters, respecting char boundaries.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

/// Timestamp format accepted by the partner API query parameters.
pub fn format_query_time(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}
