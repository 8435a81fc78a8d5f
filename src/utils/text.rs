use regex::Regex;
use std::sync::OnceLock;

fn tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[^>]+>").expect("static regex"))
}

fn space_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("static regex"))
}

/// Chapter HTML to a single line of speakable text.
pub fn strip_content(html: &str) -> String {
    if html.is_empty() {
        return String::new();
    }
    let no_tags = tag_re().replace_all(html, " ");
    space_re().replace_all(&no_tags, " ").trim().to_string()
}

/// First `max` characters (not bytes).
pub fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

pub fn char_len(text: &str) -> usize {
    text.chars().count()
}
