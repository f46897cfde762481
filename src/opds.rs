//! OPDS catalog generation.

use crate::db::{Book, timestamp_to_datetime};
use crate::formats::BookFormat;
use chrono::{DateTime, Utc};
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Content type of an acquisition feed.
pub const ACQUISITION_FEED: &str = "application/atom+xml;profile=opds-catalog;kind=acquisition";

/// A book with the names the feed shows next to it.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogEntry {
    /// Catalog row.
    #[serde(flatten)]
    pub book: Book,
    /// Author names.
    pub authors: Vec<String>,
    /// Publisher name, unless unknown.
    pub publisher: Option<String>,
    /// Tag names.
    pub tags: Vec<String>,
}

/// OPDS feed link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Link {
    /// Link relation type (e.g., "self", "subsection", "acquisition").
    pub rel: String,
    /// URL of the linked resource.
    pub href: String,
    /// MIME type of the linked resource.
    pub link_type: String,
    /// Optional title for the link.
    pub title: Option<String>,
}

/// OPDS feed entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    /// Unique identifier for the entry.
    pub id: String,
    /// Entry title.
    pub title: String,
    /// Last update timestamp.
    pub updated: DateTime<Utc>,
    /// Authors list.
    pub authors: Vec<String>,
    /// Short summary text.
    pub summary: Option<String>,
    /// Full content/description.
    pub content: Option<String>,
    /// Links associated with this entry.
    pub links: Vec<Link>,
    /// Categories/tags.
    pub categories: Vec<String>,
}

/// OPDS feed builder.
pub struct FeedBuilder {
    id: String,
    title: String,
    updated: DateTime<Utc>,
    author_name: Option<String>,
    links: Vec<Link>,
    entries: Vec<Entry>,
}

impl FeedBuilder {
    /// Create a new feed builder.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            updated: Utc::now(),
            author_name: None,
            links: Vec::new(),
            entries: Vec::new(),
        }
    }

    /// Set the feed author.
    pub fn author(mut self, name: impl Into<String>) -> Self {
        self.author_name = Some(name.into());
        self
    }

    /// Add a self link.
    pub fn self_link(mut self, href: impl Into<String>) -> Self {
        self.links.push(Link {
            rel: "self".to_string(),
            href: href.into(),
            link_type: "application/atom+xml;profile=opds-catalog".to_string(),
            title: None,
        });
        self
    }

    /// Add a start link.
    pub fn start_link(mut self, href: impl Into<String>) -> Self {
        self.links.push(Link {
            rel: "start".to_string(),
            href: href.into(),
            link_type: "application/atom+xml;profile=opds-catalog".to_string(),
            title: None,
        });
        self
    }

    /// Add a search link.
    pub fn search_link(mut self, href: impl Into<String>) -> Self {
        self.links.push(Link {
            rel: "search".to_string(),
            href: href.into(),
            link_type: "application/opensearchdescription+xml".to_string(),
            title: None,
        });
        self
    }

    /// Add an acquisition entry for a catalogued book.
    pub fn book_entry(mut self, book: &CatalogEntry, base_url: &str) -> Self {
        let mut links = vec![Link {
            rel: "http://opds-spec.org/acquisition".to_string(),
            href: format!("{}/api/books/{}/download", base_url, book.book.id),
            link_type: BookFormat::Epub.mime_type().to_string(),
            title: Some("Download".to_string()),
        }];

        if book.book.has_cover {
            for rel in ["http://opds-spec.org/image", "http://opds-spec.org/image/thumbnail"] {
                links.push(Link {
                    rel: rel.to_string(),
                    href: format!("{}/api/books/{}/cover", base_url, book.book.id),
                    link_type: "image/*".to_string(),
                    title: None,
                });
            }
        }

        if let Some(publisher) = &book.publisher {
            links.push(Link {
                rel: "related".to_string(),
                href: format!(
                    "{}/opds/search?q={}",
                    base_url,
                    urlencoding::encode(publisher)
                ),
                link_type: ACQUISITION_FEED.to_string(),
                title: Some(publisher.clone()),
            });
        }

        let summary = book
            .book
            .publish_date
            .as_ref()
            .map(|date| format!("Published {}", date));

        self.entries.push(Entry {
            id: format!("urn:uuid:{}", book.book.uuid),
            title: book.book.title.clone(),
            updated: timestamp_to_datetime(book.book.last_modified),
            authors: book.authors.clone(),
            summary,
            content: None,
            links,
            categories: book.tags.clone(),
        });
        self
    }

    /// Build the XML feed.
    pub fn build(self) -> String {
        let mut writer = Writer::new(Cursor::new(Vec::new()));

        // XML declaration - writing to Vec can't fail
        let _ = writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)));

        // Feed element
        let mut feed = BytesStart::new("feed");
        feed.push_attribute(("xmlns", "http://www.w3.org/2005/Atom"));
        feed.push_attribute(("xmlns:opds", "http://opds-spec.org/2010/catalog"));
        feed.push_attribute(("xmlns:dc", "http://purl.org/dc/elements/1.1/"));
        let _ = writer.write_event(Event::Start(feed));

        // ID
        write_text_element(&mut writer, "id", &self.id);

        // Title
        write_text_element(&mut writer, "title", &self.title);

        // Updated
        write_text_element(&mut writer, "updated", &self.updated.to_rfc3339());

        // Author
        if let Some(name) = &self.author_name {
            let _ = writer.write_event(Event::Start(BytesStart::new("author")));
            write_text_element(&mut writer, "name", name);
            let _ = writer.write_event(Event::End(BytesEnd::new("author")));
        }

        // Links
        for link in &self.links {
            write_link(&mut writer, link);
        }

        // Entries
        for entry in &self.entries {
            write_entry(&mut writer, entry);
        }

        // Close feed
        let _ = writer.write_event(Event::End(BytesEnd::new("feed")));

        String::from_utf8(writer.into_inner().into_inner()).unwrap_or_default()
    }
}

/// Write a simple text element.
fn write_text_element<W: std::io::Write>(writer: &mut Writer<W>, name: &str, text: &str) {
    let _ = writer.write_event(Event::Start(BytesStart::new(name)));
    let _ = writer.write_event(Event::Text(BytesText::new(text)));
    let _ = writer.write_event(Event::End(BytesEnd::new(name)));
}

/// Write a link element.
fn write_link<W: std::io::Write>(writer: &mut Writer<W>, link: &Link) {
    let mut elem = BytesStart::new("link");
    elem.push_attribute(("rel", link.rel.as_str()));
    elem.push_attribute(("href", link.href.as_str()));
    elem.push_attribute(("type", link.link_type.as_str()));
    if let Some(title) = &link.title {
        elem.push_attribute(("title", title.as_str()));
    }
    let _ = writer.write_event(Event::Empty(elem));
}

/// Write an entry element.
fn write_entry<W: std::io::Write>(writer: &mut Writer<W>, entry: &Entry) {
    let _ = writer.write_event(Event::Start(BytesStart::new("entry")));

    write_text_element(writer, "id", &entry.id);
    write_text_element(writer, "title", &entry.title);
    write_text_element(writer, "updated", &entry.updated.to_rfc3339());

    // Authors
    for author in &entry.authors {
        let _ = writer.write_event(Event::Start(BytesStart::new("author")));
        write_text_element(writer, "name", author);
        let _ = writer.write_event(Event::End(BytesEnd::new("author")));
    }

    // Summary
    if let Some(summary) = &entry.summary {
        let mut elem = BytesStart::new("summary");
        elem.push_attribute(("type", "text"));
        let _ = writer.write_event(Event::Start(elem));
        let _ = writer.write_event(Event::Text(BytesText::new(summary)));
        let _ = writer.write_event(Event::End(BytesEnd::new("summary")));
    }

    // Content
    if let Some(content) = &entry.content {
        let mut elem = BytesStart::new("content");
        elem.push_attribute(("type", "html"));
        let _ = writer.write_event(Event::Start(elem));
        let _ = writer.write_event(Event::Text(BytesText::new(content)));
        let _ = writer.write_event(Event::End(BytesEnd::new("content")));
    }

    // Links
    for link in &entry.links {
        write_link(writer, link);
    }

    // Categories
    for category in &entry.categories {
        let mut elem = BytesStart::new("category");
        elem.push_attribute(("term", category.as_str()));
        elem.push_attribute(("label", category.as_str()));
        let _ = writer.write_event(Event::Empty(elem));
    }

    let _ = writer.write_event(Event::End(BytesEnd::new("entry")));
}

/// Generate OpenSearch description XML.
pub fn generate_opensearch(title: &str, base_url: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<OpenSearchDescription xmlns="http://a9.com/-/spec/opensearch/1.1/">
  <ShortName>{}</ShortName>
  <Description>Search the {} catalog</Description>
  <InputEncoding>UTF-8</InputEncoding>
  <OutputEncoding>UTF-8</OutputEncoding>
  <Url type="application/atom+xml;profile=opds-catalog" template="{}/opds/search?q={{searchTerms}}"/>
</OpenSearchDescription>"#,
        title, title, base_url
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(has_cover: bool) -> CatalogEntry {
        CatalogEntry {
            book: Book {
                id: 7,
                title: "Dune & Sons".to_string(),
                sort_title: "Dune & Sons".to_string(),
                publish_date: Some("1965".to_string()),
                author_sort: "Herbert, Frank".to_string(),
                isbn: None,
                path: "1/books/dune/dune.epub".to_string(),
                uuid: "0b8f2c43-3a54-4f5c-9a8e-8f0a6f1f3f11".to_string(),
                has_cover,
                last_modified: 0,
            },
            authors: vec!["Frank Herbert".to_string()],
            publisher: Some("Chilton".to_string()),
            tags: vec!["scifi".to_string()],
        }
    }

    #[test]
    fn test_book_entry_feed() {
        let xml = FeedBuilder::new("urn:uuid:all", "All Books")
            .self_link("/opds")
            .book_entry(&entry(true), "")
            .build();

        let doc = roxmltree::Document::parse(&xml).unwrap();
        let entry = doc
            .descendants()
            .find(|n| n.has_tag_name("entry"))
            .unwrap();
        let title = entry
            .children()
            .find(|n| n.has_tag_name("title"))
            .and_then(|n| n.text());
        assert_eq!(title, Some("Dune & Sons"));

        let hrefs: Vec<_> = entry
            .children()
            .filter(|n| n.has_tag_name("link"))
            .filter_map(|n| n.attribute("href"))
            .collect();
        assert!(hrefs.contains(&"/api/books/7/download"));
        assert!(hrefs.contains(&"/api/books/7/cover"));
        assert!(xml.contains("urn:uuid:0b8f2c43-3a54-4f5c-9a8e-8f0a6f1f3f11"));
        assert!(xml.contains(r#"term="scifi""#));
    }

    #[test]
    fn test_no_cover_links_without_cover() {
        let xml = FeedBuilder::new("urn:uuid:all", "All Books")
            .book_entry(&entry(false), "")
            .build();
        assert!(!xml.contains("/cover"));
    }
}
