//! # Job Identifier Derivation
//!
//! Maps object keys and managed-service job names back to canonical job ids.
//!
//! ## Naming Convention:
//! Job names are composed as `<prefix>-<jobId>-<epochMillis>[-<suffix>]`:
//! - `auto-...`: started by the storage write trigger
//! - `transcribe-...`: started explicitly by the submitter
//!
//! `derive` inverts the composition: storage-triggered pattern first, then the
//! explicit pattern, then verbatim stripping of known prefixes and suffixes.
//! It is pure and total; an unparseable name degrades to the stripped name.

use regex::Regex;
use std::sync::OnceLock;
use uuid::Uuid;

/// How a managed job was started, which decides its name prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamingPattern {
    StorageTriggered,
    Explicit,
}

impl NamingPattern {
    pub fn prefix(&self) -> &'static str {
        match self {
            NamingPattern::StorageTriggered => "auto",
            NamingPattern::Explicit => "transcribe",
        }
    }
}

/// Prefixes seen on job names over time, stripped verbatim as a last resort.
const KNOWN_PREFIXES: &[&str] = &["auto-", "transcribe-", "transcription-", "job-"];

/// Suffixes stripped verbatim as a last resort.
const KNOWN_SUFFIXES: &[&str] = &[".json", "-transcript", "-result"];

const MAX_SUFFIX_LEN: usize = 12;

fn storage_triggered_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?s)^auto-(?P<id>.+)-(?P<ts>\d{13})(?:-(?P<suffix>[a-z0-9]{1,12}))?$")
            .expect("storage-triggered job name pattern is valid")
    })
}

fn explicit_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?s)^transcribe-(?P<id>.+)-(?P<ts>\d{13})(?:-(?P<suffix>[a-z0-9]{1,12}))?$")
            .expect("explicit job name pattern is valid")
    })
}

/// Fresh canonical id: a UUID in simple (hyphen-free) form.
pub fn new_job_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Short lowercase alphanumeric suffix used to keep explicit job names unique
/// across retries.
pub fn new_name_suffix() -> String {
    let mut suffix = Uuid::new_v4().simple().to_string();
    suffix.truncate(6);
    suffix
}

/// Compose a managed-service job name for `job_id`.
///
/// Suffixes must be 1-12 lowercase alphanumerics; anything else is dropped so
/// the name stays derivable.
pub fn compose_job_name(
    pattern: NamingPattern,
    job_id: &str,
    epoch_millis: i64,
    suffix: Option<&str>,
) -> String {
    let base = format!("{}-{}-{:013}", pattern.prefix(), job_id, epoch_millis.max(0));
    match suffix.filter(|s| is_valid_suffix(s)) {
        Some(suffix) => format!("{}-{}", base, suffix),
        None => base,
    }
}

fn is_valid_suffix(suffix: &str) -> bool {
    !suffix.is_empty()
        && suffix.len() <= MAX_SUFFIX_LEN
        && suffix.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
}

/// Canonical job id for a managed-service job name.
pub fn derive(job_name: &str) -> String {
    let name = job_name.trim();

    for pattern in [storage_triggered_pattern(), explicit_pattern()] {
        if let Some(id) = pattern.captures(name).and_then(|c| c.name("id")) {
            return id.as_str().to_string();
        }
    }

    strip_known_affixes(name)
}

fn strip_known_affixes(name: &str) -> String {
    let mut stripped = name;
    if let Some(rest) = KNOWN_PREFIXES.iter().find_map(|p| stripped.strip_prefix(p)) {
        stripped = rest;
    }
    if let Some(rest) = KNOWN_SUFFIXES.iter().find_map(|s| stripped.strip_suffix(s)) {
        stripped = rest;
    }

    if stripped.is_empty() {
        name.to_string()
    } else {
        stripped.to_string()
    }
}

/// Canonical job id for an object key such as `uploads/<id>.wav`: the last
/// path segment without its extension.
pub fn derive_from_key(key: &str) -> String {
    let file = key.trim().rsplit('/').next().unwrap_or(key);
    match file.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => file.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MILLIS: i64 = 1_726_000_000_123;

    fn awkward_ids() -> Vec<String> {
        vec![
            new_job_id(),
            "abc".to_string(),
            "a-b-c".to_string(),
            "9f1c2d3e-aaaa-bbbb-cccc-000000000000".to_string(),
            "clip-1234567890123".to_string(),
            "x-1234567890123-abc".to_string(),
            "auto-nested".to_string(),
            "transcribe-1".to_string(),
            "1700000000000".to_string(),
            "with space".to_string(),
        ]
    }

    #[test]
    fn test_round_trip_for_every_pattern() {
        for id in awkward_ids() {
            for pattern in [NamingPattern::StorageTriggered, NamingPattern::Explicit] {
                for suffix in [None, Some("r1"), Some("abc123"), Some("123456789012")] {
                    let name = compose_job_name(pattern, &id, MILLIS, suffix);
                    assert_eq!(derive(&name), id, "name {}", name);
                }
            }
        }
    }

    #[test]
    fn test_compose_shape() {
        assert_eq!(
            compose_job_name(NamingPattern::StorageTriggered, "abc", MILLIS, None),
            "auto-abc-1726000000123"
        );
        assert_eq!(
            compose_job_name(NamingPattern::Explicit, "abc", 42, Some("k9")),
            "transcribe-abc-0000000000042-k9"
        );
    }

    #[test]
    fn test_invalid_suffix_is_dropped() {
        let name = compose_job_name(NamingPattern::Explicit, "abc", MILLIS, Some("Not-Valid"));
        assert_eq!(name, "transcribe-abc-1726000000123");
        let long = compose_job_name(NamingPattern::Explicit, "abc", MILLIS, Some("1234567890123"));
        assert_eq!(derive(&long), "abc");
    }

    #[test]
    fn test_fallback_strips_known_affixes() {
        assert_eq!(derive("auto-legacy"), "legacy");
        assert_eq!(derive("transcription-meeting-notes"), "meeting-notes");
        assert_eq!(derive("job-42.json"), "42");
        assert_eq!(derive("plain-name-transcript"), "plain-name");
    }

    #[test]
    fn test_unparseable_names_degrade() {
        assert_eq!(derive("somethingelse"), "somethingelse");
        assert_eq!(derive("  spaced  "), "spaced");
        assert_eq!(derive("auto-"), "auto-");
        assert_eq!(derive(""), "");
    }

    #[test]
    fn test_derive_from_key() {
        assert_eq!(derive_from_key("uploads/abc123.wav"), "abc123");
        assert_eq!(derive_from_key("public/uploads/nested/abc.m4a"), "abc");
        assert_eq!(derive_from_key("uploads/noext"), "noext");
        assert_eq!(derive_from_key(".hidden"), ".hidden");
    }

    #[test]
    fn test_new_ids_are_unique_and_simple() {
        let a = new_job_id();
        let b = new_job_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
        assert!(!a.contains('-'));
        assert!(is_valid_suffix(&new_name_suffix()));
    }
}
