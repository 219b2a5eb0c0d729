use regex::Regex;
use std::sync::OnceLock;

struct Patterns {
    body: Regex,
    hidden: Regex,
    comment: Regex,
    tag: Regex,
    heading: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        body: Regex::new(r"(?is)<body[^>]*>(.*)</body>").expect("valid regex"),
        hidden: Regex::new(r"(?is)<(script|style|head)\b[^>]*>.*?</(script|style|head)>")
            .expect("valid regex"),
        comment: Regex::new(r"(?s)<!--.*?-->").expect("valid regex"),
        tag: Regex::new(r"(?s)<[^>]*>").expect("valid regex"),
        heading: Regex::new(r"(?is)<(title|h1|h2|h3)\b[^>]*>(.*?)</(title|h1|h2|h3)>")
            .expect("valid regex"),
    })
}

/// Plain text of an XHTML document: every text node decoded and trimmed,
/// empty ones dropped, the rest separated by blank lines.
pub fn extract_text(markup: &str) -> String {
    let p = patterns();
    let body = p
        .body
        .captures(markup)
        .and_then(|caps| caps.get(1))
        .map_or(markup, |m| m.as_str());
    let body = p.comment.replace_all(body, "");
    let body = p.hidden.replace_all(&body, "");

    p.tag
        .split(&body)
        .map(|node| html_escape::decode_html_entities(node))
        .map(|node| node.trim().to_string())
        .filter(|node| !node.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// First non-empty `<title>` or `<h1>`-`<h3>` text in document order.
pub fn find_title(markup: &str) -> Option<String> {
    patterns().heading.captures_iter(markup).find_map(|caps| {
        let inner = patterns().tag.replace_all(&caps[2], "");
        let title = html_escape::decode_html_entities(&inner)
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        (!title.is_empty()).then_some(title)
    })
}

/// Heading plus one paragraph per non-blank line.
pub fn render_fragment(heading: &str, text: &str) -> String {
    let mut html = format!("<h1>{}</h1>", html_escape::encode_text(heading.trim()));
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        html.push_str("<p>");
        html.push_str(&html_escape::encode_text(line));
        html.push_str("</p>");
    }
    html
}

/// Wraps a fragment into a standalone XHTML document.
pub fn xhtml_document(title: &str, fragment: &str, lang: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n\
         <!DOCTYPE html>\n\
         <html xmlns=\"http://www.w3.org/1999/xhtml\" xmlns:epub=\"http://www.idpf.org/2007/ops\" \
         lang=\"{lang}\" xml:lang=\"{lang}\">\n\
         <head><title>{title}</title></head>\n\
         <body>{fragment}</body>\n\
         </html>\n",
        lang = html_escape::encode_double_quoted_attribute(lang),
        title = html_escape::encode_text(title),
    )
}
