//! Plain-text extraction from article pages and feed HTML.

use itertools::Itertools;
use once_cell::sync::Lazy;
use scraper::{Html, Selector};

/// Paragraph selectors, most specific first.
static PARAGRAPH_SELECTORS: Lazy<Vec<Selector>> = Lazy::new(|| {
    ["article p", "main p", "p"]
        .iter()
        .filter_map(|s| Selector::parse(s).ok())
        .collect()
});

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().join(" ")
}

/// Extract the article text from a full HTML page.
///
/// Paragraphs are taken from `<article>`, else `<main>`, else the whole
/// document, and joined with blank lines.
pub fn extract_article_text(html: &str) -> String {
    let document = Html::parse_document(html);
    for selector in PARAGRAPH_SELECTORS.iter() {
        let paragraphs: Vec<String> = document
            .select(selector)
            .map(|p| collapse_whitespace(&p.text().collect::<String>()))
            .filter(|p| !p.is_empty())
            .collect();
        if !paragraphs.is_empty() {
            return paragraphs.join("\n\n");
        }
    }
    String::new()
}

/// Strip tags from an HTML fragment such as a feed summary.
pub fn html_to_text(fragment: &str) -> String {
    let parsed = Html::parse_fragment(fragment);
    collapse_whitespace(&parsed.root_element().text().join(" "))
}

/// Pick the article body: page text if long enough, else the longer feed field.
///
/// # Returns
///
/// `None` when no candidate reaches `min_chars` characters.
pub fn choose_body(
    page_text: &str,
    content: &str,
    summary: &str,
    min_chars: usize,
) -> Option<String> {
    if page_text.chars().count() >= min_chars {
        return Some(page_text.to_string());
    }
    [html_to_text(content), html_to_text(summary)]
        .into_iter()
        .max_by_key(|t| t.chars().count())
        .filter(|t| t.chars().count() >= min_chars)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefers_article_paragraphs() {
        let html = r#"<html><body>
            <nav><p>Menu</p></nav>
            <article><h1>Title</h1><p>First   paragraph.</p><p>Second
            paragraph.</p></article>
            <footer><p>Footer</p></footer>
        </body></html>"#;
        assert_eq!(
            extract_article_text(html),
            "First paragraph.\n\nSecond paragraph."
        );
    }

    #[test]
    fn test_falls_back_to_any_paragraph() {
        let html = "<html><body><div><p>Lonely text</p></div></body></html>";
        assert_eq!(extract_article_text(html), "Lonely text");
        assert_eq!(extract_article_text("<html><body></body></html>"), "");
    }

    #[test]
    fn test_html_to_text() {
        assert_eq!(
            html_to_text("<p>Short <b>summary</b> here</p>"),
            "Short summary here"
        );
    }

    #[test]
    fn test_choose_body() {
        let long = "word ".repeat(40);
        assert_eq!(choose_body(&long, "", "", 150).as_deref(), Some(long.as_str()));

        let feed_html = format!("<p>{long}</p>");
        let body = choose_body("tiny", &feed_html, "<p>short</p>", 150).unwrap();
        assert_eq!(body, long.trim());

        assert_eq!(choose_body("tiny", "", "<p>short</p>", 150), None);
    }
}
