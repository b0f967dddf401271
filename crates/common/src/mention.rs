// @mention extraction and resolution against known members.

use std::sync::OnceLock;

use regex::Regex;

fn mention_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"@(\w+)").expect("mention pattern should compile"))
}

/// Extract `@token` mentions from raw message text, in order of first
/// appearance, without duplicates.
pub fn extract_mentions(text: &str) -> Vec<String> {
    let mut tokens: Vec<String> = Vec::new();
    for capture in mention_regex().captures_iter(text) {
        let token = &capture[1];
        if !tokens.iter().any(|existing| existing == token) {
            tokens.push(token.to_string());
        }
    }
    tokens
}

/// Strategy deciding whether a mention token refers to a member.
///
/// Fan-out code only depends on this trait, so the loose default can be
/// swapped for a stricter strategy without touching delivery.
pub trait MentionMatcher: Send + Sync {
    fn matches(&self, token: &str, display_name: &str) -> bool;
}

/// Case-insensitive substring match of the token inside the display name.
/// One token may match several members.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubstringMatcher;

impl MentionMatcher for SubstringMatcher {
    fn matches(&self, token: &str, display_name: &str) -> bool {
        !token.is_empty() && display_name.to_lowercase().contains(&token.to_lowercase())
    }
}

/// Case-insensitive match of the whole display name, ignoring whitespace.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactMatcher;

impl MentionMatcher for ExactMatcher {
    fn matches(&self, token: &str, display_name: &str) -> bool {
        let compact: String = display_name.chars().filter(|c| !c.is_whitespace()).collect();
        !token.is_empty() && compact.eq_ignore_ascii_case(token)
    }
}

/// Resolve mention tokens to identity ids.
///
/// `candidates` yields `(identity_id, display_name)` pairs; an identity
/// appearing more than once (e.g. member of several channels) is reported
/// once.
pub fn resolve_mentions<'a, I>(
    tokens: &[String],
    candidates: I,
    matcher: &dyn MentionMatcher,
) -> Vec<String>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    if tokens.is_empty() {
        return Vec::new();
    }

    let mut resolved: Vec<String> = Vec::new();
    for (identity_id, display_name) in candidates {
        if resolved.iter().any(|id| id == identity_id) {
            continue;
        }
        if tokens.iter().any(|token| matcher.matches(token, display_name)) {
            resolved.push(identity_id.to_string());
        }
    }
    resolved
}
