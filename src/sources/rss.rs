//! RSS 2.0, RDF and Atom parsing.
//!
//! A single streaming pass over the document collects `<item>` (RSS/RDF) and
//! `<entry>` (Atom) elements. Namespaced children are matched by local name,
//! so `content:encoded` and `dc:date` are picked up without namespace
//! bookkeeping.

use crate::error::{Result, RobotError};
use chrono::{DateTime, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedItem {
    pub title: String,
    pub link: String,
    /// `<description>` / `<summary>`, usually HTML.
    pub summary: String,
    /// `<content:encoded>` / `<content>`, usually HTML.
    pub content: String,
    pub published: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Title,
    Link,
    Guid,
    Summary,
    Content,
    Date,
}

fn field_for(local_name: &[u8]) -> Option<Field> {
    match local_name {
        b"title" => Some(Field::Title),
        b"link" => Some(Field::Link),
        b"guid" | b"id" => Some(Field::Guid),
        b"description" | b"summary" => Some(Field::Summary),
        b"encoded" | b"content" => Some(Field::Content),
        b"pubDate" | b"published" | b"updated" | b"date" => Some(Field::Date),
        _ => None,
    }
}

fn attr(e: &BytesStart<'_>, key: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == key)
        .and_then(|a| a.unescape_value().ok())
        .map(|v| v.into_owned())
}

/// Atom `<link href=".." rel="alternate"/>`; a missing `rel` means alternate.
fn atom_href(e: &BytesStart<'_>) -> Option<String> {
    let rel = attr(e, b"rel");
    if rel.as_deref().is_none_or(|r| r == "alternate") {
        attr(e, b"href")
    } else {
        None
    }
}

/// Parse an RFC 2822 (RSS) or RFC 3339 (Atom, Dublin Core) date.
pub fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .map(|d| d.with_timezone(&Utc))
        .ok()
}

struct ItemBuilder {
    item: FeedItem,
    guid: String,
    date: String,
}

impl ItemBuilder {
    fn new() -> Self {
        Self {
            item: FeedItem::default(),
            guid: String::new(),
            date: String::new(),
        }
    }

    /// Whether text for `field` should still be collected.
    fn wants(&self, field: Field) -> bool {
        match field {
            Field::Title => self.item.title.is_empty(),
            Field::Link => self.item.link.is_empty(),
            Field::Guid => self.guid.is_empty(),
            Field::Date => self.date.is_empty(),
            Field::Summary | Field::Content => true,
        }
    }

    fn push(&mut self, field: Field, text: &str) {
        let target = match field {
            Field::Title => &mut self.item.title,
            Field::Link => &mut self.item.link,
            Field::Guid => &mut self.guid,
            Field::Summary => &mut self.item.summary,
            Field::Content => &mut self.item.content,
            Field::Date => &mut self.date,
        };
        target.push_str(text);
    }

    fn finish(mut self) -> FeedItem {
        self.item.title = self.item.title.trim().to_string();
        self.item.link = self.item.link.trim().to_string();
        if self.item.link.is_empty() && self.guid.trim().starts_with("http") {
            self.item.link = self.guid.trim().to_string();
        }
        self.item.published = parse_date(&self.date);
        self.item
    }
}

/// Parse every item or entry out of a feed document, in document order.
///
/// # Errors
///
/// [`RobotError::Feed`] when the XML is malformed.
pub fn parse_feed(xml: &str) -> Result<Vec<FeedItem>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut items = Vec::new();
    let mut current: Option<ItemBuilder> = None;
    let mut field: Option<Field> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = e.local_name();
                let name = name.as_ref();
                if name == b"item" || name == b"entry" {
                    current = Some(ItemBuilder::new());
                    field = None;
                } else if let Some(builder) = current.as_mut() {
                    if let Some(f) = field_for(name) {
                        field = builder.wants(f).then_some(f);
                        if f == Field::Link && builder.wants(Field::Link) {
                            if let Some(href) = atom_href(&e) {
                                builder.push(Field::Link, &href);
                                field = None;
                            }
                        }
                    }
                }
            }
            Ok(Event::Empty(e)) => {
                if let Some(builder) = current.as_mut() {
                    if e.local_name().as_ref() == b"link" && builder.wants(Field::Link) {
                        if let Some(href) = atom_href(&e) {
                            builder.push(Field::Link, &href);
                        }
                    }
                }
            }
            Ok(Event::Text(t)) => {
                if let (Some(builder), Some(f)) = (current.as_mut(), field) {
                    let text = t
                        .unescape()
                        .map_err(|e| RobotError::Feed(format!("bad text: {e}")))?;
                    builder.push(f, &text);
                }
            }
            Ok(Event::CData(c)) => {
                if let (Some(builder), Some(f)) = (current.as_mut(), field) {
                    builder.push(f, &String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Ok(Event::End(e)) => {
                let name = e.local_name();
                let name = name.as_ref();
                if name == b"item" || name == b"entry" {
                    if let Some(builder) = current.take() {
                        items.push(builder.finish());
                    }
                    field = None;
                } else if field_for(name).is_some() {
                    field = None;
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(RobotError::Feed(format!(
                    "malformed XML at byte {}: {e}",
                    reader.buffer_position()
                )));
            }
            _ => {}
        }
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:content="http://purl.org/rss/1.0/modules/content/">
  <channel>
    <title>Tech Feed</title>
    <link>https://tech.example</link>
    <item>
      <title>Chips &amp; Dips</title>
      <link>https://tech.example/chips</link>
      <description><![CDATA[<p>Short <b>summary</b></p>]]></description>
      <content:encoded><![CDATA[<p>Full body text</p>]]></content:encoded>
      <pubDate>Tue, 10 Jun 2025 14:30:00 +0000</pubDate>
    </item>
    <item>
      <title>Second</title>
      <guid isPermaLink="true">https://tech.example/second</guid>
    </item>
  </channel>
</rss>"#;

    const ATOM: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Atom Feed</title>
  <entry>
    <title>Atom Story</title>
    <link rel="self" href="https://atom.example/self.xml"/>
    <link rel="alternate" href="https://atom.example/story"/>
    <id>urn:uuid:1234</id>
    <published>2025-06-10T08:00:00Z</published>
    <summary>An atom summary</summary>
  </entry>
</feed>"#;

    #[test]
    fn test_parse_rss_items() {
        let items = parse_feed(RSS).unwrap();
        assert_eq!(items.len(), 2);

        let first = &items[0];
        assert_eq!(first.title, "Chips & Dips");
        assert_eq!(first.link, "https://tech.example/chips");
        assert_eq!(first.summary, "<p>Short <b>summary</b></p>");
        assert_eq!(first.content, "<p>Full body text</p>");
        assert_eq!(
            first.published.unwrap().to_rfc3339(),
            "2025-06-10T14:30:00+00:00"
        );
    }

    #[test]
    fn test_guid_permalink_fills_missing_link() {
        let items = parse_feed(RSS).unwrap();
        assert_eq!(items[1].link, "https://tech.example/second");
        assert_eq!(items[1].published, None);
    }

    #[test]
    fn test_parse_atom_entry_prefers_alternate_link() {
        let items = parse_feed(ATOM).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "Atom Story");
        assert_eq!(items[0].link, "https://atom.example/story");
        assert_eq!(items[0].summary, "An atom summary");
        assert!(items[0].published.is_some());
    }

    #[test]
    fn test_channel_title_is_not_an_item() {
        let items = parse_feed(RSS).unwrap();
        assert!(items.iter().all(|i| i.title != "Tech Feed"));
    }

    #[test]
    fn test_malformed_xml_is_feed_error() {
        let result = parse_feed("<rss><channel><item><title>x</item></rss>");
        assert!(matches!(result, Err(RobotError::Feed(_))));
    }

    #[test]
    fn test_parse_date_formats() {
        assert!(parse_date("Tue, 10 Jun 2025 14:30:00 GMT").is_some());
        assert!(parse_date("2025-06-10T08:00:00+02:00").is_some());
        assert!(parse_date("yesterday").is_none());
    }
}
