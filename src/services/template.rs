use regex::{Captures, Regex};
use std::sync::OnceLock;

fn placeholder() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex"))
}

/// Replaces `{name}` placeholders in one pass. Values are never rescanned, so
/// book text that happens to contain `{chunk}` is left alone. Unknown
/// placeholders stay as written.
pub fn fill(template: &str, values: &[(&str, &str)]) -> String {
    placeholder()
        .replace_all(template, |caps: &Captures| {
            let name = &caps[1];
            values
                .iter()
                .find(|(key, _)| *key == name)
                .map_or_else(|| caps[0].to_string(), |(_, value)| value.to_string())
        })
        .into_owned()
}
