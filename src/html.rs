//! Minimal inline HTML surfaces (spec §4.3.1, §8 scenario 6).
//!
//! No templating crate is pulled in for two pages — the corpus reaches for
//! `askama`/`tera` when a site has many templates, but Transit has exactly
//! two, both trivial substitutions, so plain `format!` stays in the spirit
//! of "surface, not core" from spec §1.

use crate::metadata::FileMetadata;

/// Known link-preview crawler user-agent substrings (spec §4.3.1). Matching
/// is case-insensitive substring search, mirroring how the original keys off
/// `user_agent.lower()`.
const CRAWLER_USER_AGENTS: &[&str] = &[
    "whatsapp",
    "facebookexternalhit",
    "twitterbot",
    "slackbot-linkexpanding",
    "discordbot",
    "googlebot",
    "bingbot",
    "linkedinbot",
    "pinterestbot",
    "telegrambot",
];

pub fn is_crawler(user_agent: &str) -> bool {
    let ua = user_agent.to_ascii_lowercase();
    CRAWLER_USER_AGENTS.iter().any(|needle| ua.contains(needle))
}

pub fn is_curl(user_agent: &str) -> bool {
    user_agent.to_ascii_lowercase().contains("curl")
}

/// Link-preview card for crawlers. Deliberately omits "Ready to download" —
/// scenario 6 asserts a crawler never sees that phrase.
pub fn preview_page(file: &FileMetadata) -> String {
    let (name, size, content_type) = file.human_readable();
    format!(
        "<!DOCTYPE html>\n<html><head>\n<meta property=\"og:title\" content=\"{name}\">\n\
<meta property=\"og:description\" content=\"{size} · {content_type}\">\n\
<title>{name}</title>\n</head><body>\n<h1>{name}</h1>\n<p>{size}</p>\n</body></html>\n"
    )
}

/// Interstitial gate shown to a plain browser before it commits to the download.
pub fn download_gate_page(uid: &str, file: &FileMetadata) -> String {
    let (name, size, content_type) = file.human_readable();
    format!(
        "<!DOCTYPE html>\n<html><head><title>{name}</title></head><body>\n\
<h1>{name}</h1>\n<p>{size} &middot; {content_type}</p>\n\
<p>Ready to download.</p>\n\
<a href=\"/{uid}?download=true\">Download</a>\n\
</body></html>\n"
    )
}

pub const ROBOTS_TXT: &str = "User-agent: *\nDisallow:\n";
