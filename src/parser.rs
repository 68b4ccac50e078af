use feed_rs::model::Link;
use quick_xml::encoding::Decoder;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Title given to entries that carry none.
pub const UNTITLED: &str = "[No Title]";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedFeed {
    pub channel_title: Option<String>,
    /// Entries in document order, newest first for well-behaved feeds.
    pub entries: Vec<Entry>,
    /// Set when the document was malformed and `entries` were salvaged.
    pub degraded: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub title: String,
    pub link: Option<String>,
}

impl ParsedFeed {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Title of the first entry in document order.
    pub fn newest_title(&self) -> Option<&str> {
        self.entries.first().map(|e| e.title.as_str())
    }
}

/// Parse a fetched RSS/Atom document.
///
/// Never fails: when `feed-rs` rejects the document, the error message is kept in
/// [`ParsedFeed::degraded`] and whatever titles and links a lenient XML scan can
/// recover are returned instead. Empty input gives an empty feed.
pub fn parse(bytes: &[u8]) -> ParsedFeed {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return ParsedFeed::default();
    }

    match feed_rs::parser::parse(bytes) {
        Ok(feed) => ParsedFeed {
            channel_title: feed.title.map(|t| t.content),
            entries: feed
                .entries
                .into_iter()
                .map(|entry| Entry {
                    title: entry
                        .title
                        .map(|t| t.content)
                        .unwrap_or_else(|| UNTITLED.to_string()),
                    link: entry_link(&entry.links),
                })
                .collect(),
            degraded: None,
        },
        Err(e) => {
            let mut feed = salvage(bytes);
            debug!(
                "Salvaged {} entries from malformed feed: {}",
                feed.entries.len(),
                e
            );
            feed.degraded = Some(e.to_string());
            feed
        }
    }
}

/// Prefer the entry's alternate link (or one without `rel`) over `self`,
/// `replies` and friends, then fall back to whatever comes first.
fn entry_link(links: &[Link]) -> Option<String> {
    links
        .iter()
        .find(|l| is_alternate(l.rel.as_deref()))
        .or_else(|| links.first())
        .map(|l| l.href.clone())
}

fn is_alternate(rel: Option<&str>) -> bool {
    matches!(rel, None | Some("alternate"))
}

/// Best-effort scan of malformed markup for `<item>`/`<entry>` elements.
///
/// End tags are not matched against their start tags, so truncated and
/// mis-nested documents still yield the entries seen before the damage.
fn salvage(bytes: &[u8]) -> ParsedFeed {
    let mut reader = Reader::from_reader(bytes);
    let config = reader.config_mut();
    config.check_end_names = false;
    config.allow_unmatched_ends = true;

    let mut scan = Salvage::default();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"item" | b"entry" => scan.start_entry(),
                b"title" => scan.start_field(Field::Title),
                b"link" => match link_href(&e, reader.decoder()) {
                    Some((href, alternate)) => scan.offer_link(href, alternate),
                    None => scan.start_field(Field::Link),
                },
                _ => {}
            },
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"link" => {
                if let Some((href, alternate)) = link_href(&e, reader.decoder()) {
                    scan.offer_link(href, alternate);
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"item" | b"entry" => scan.finish_entry(),
                b"title" => scan.end_field(Field::Title),
                b"link" => scan.end_field(Field::Link),
                _ => {}
            },
            Ok(Event::Text(e)) => match e.unescape() {
                Ok(text) => scan.push_text(&text),
                // Unknown entity such as `&nbsp;`, keep the raw text
                Err(_) => scan.push_text(&String::from_utf8_lossy(&e)),
            },
            Ok(Event::CData(e)) => scan.push_text(&String::from_utf8_lossy(&e)),
            Ok(Event::Eof) => break,
            Err(e) => {
                debug!(
                    position = reader.buffer_position(),
                    "Salvage scan stopped: {}", e
                );
                break;
            }
            _ => {}
        }
        buf.clear();
    }
    scan.finish_entry();

    ParsedFeed {
        channel_title: scan.channel_title,
        entries: scan.entries,
        degraded: None,
    }
}

/// `href` of a `<link>` element and whether it is an alternate link.
fn link_href(element: &BytesStart<'_>, decoder: Decoder) -> Option<(String, bool)> {
    let mut href = None;
    let mut rel = None;

    for attr in element.attributes().flatten() {
        let value = match attr.decode_and_unescape_value(decoder) {
            Ok(value) => value.trim().to_string(),
            Err(_) => continue,
        };
        match attr.key.local_name().as_ref() {
            b"href" => href = Some(value),
            b"rel" => rel = Some(value),
            _ => {}
        }
    }

    Some((href?, is_alternate(rel.as_deref())))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Title,
    Link,
}

#[derive(Default)]
struct EntryBuilder {
    title: Option<String>,
    link: Option<String>,
    has_alternate: bool,
}

impl EntryBuilder {
    fn offer_link(&mut self, href: String, alternate: bool) {
        if href.is_empty() {
            return;
        }
        if alternate && !self.has_alternate {
            self.link = Some(href);
            self.has_alternate = true;
        } else if self.link.is_none() {
            self.link = Some(href);
        }
    }

    fn build(self) -> Entry {
        Entry {
            title: self
                .title
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| UNTITLED.to_string()),
            link: self.link,
        }
    }
}

#[derive(Default)]
struct Salvage {
    channel_title: Option<String>,
    entries: Vec<Entry>,
    current: Option<EntryBuilder>,
    capture: Option<(Field, String)>,
}

impl Salvage {
    fn start_entry(&mut self) {
        // An unclosed previous entry ends where the next one starts
        self.finish_entry();
        self.current = Some(EntryBuilder::default());
    }

    fn finish_entry(&mut self) {
        self.finish_field();
        if let Some(entry) = self.current.take() {
            self.entries.push(entry.build());
        }
    }

    fn start_field(&mut self, field: Field) {
        self.finish_field();
        self.capture = Some((field, String::new()));
    }

    fn end_field(&mut self, field: Field) {
        if matches!(self.capture, Some((open, _)) if open == field) {
            self.finish_field();
        }
    }

    fn push_text(&mut self, text: &str) {
        if let Some((_, buf)) = &mut self.capture {
            buf.push_str(text);
        }
    }

    fn offer_link(&mut self, href: String, alternate: bool) {
        if let Some(entry) = &mut self.current {
            entry.offer_link(href, alternate);
        }
    }

    fn finish_field(&mut self) {
        let Some((field, text)) = self.capture.take() else {
            return;
        };
        let text = text.trim().to_string();

        match (&mut self.current, field) {
            (Some(entry), Field::Title) => {
                if entry.title.is_none() {
                    entry.title = Some(text);
                }
            }
            (Some(entry), Field::Link) => entry.offer_link(text, true),
            // The channel title is the first title before any entry
            (None, Field::Title) => {
                if self.entries.is_empty() && self.channel_title.is_none() && !text.is_empty() {
                    self.channel_title = Some(text);
                }
            }
            (None, Field::Link) => {}
        }
    }
}
