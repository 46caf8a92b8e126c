use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::io::Cursor;
use std::path::Path;
use thiserror::Error;

use crate::storage::Feed;

/// Maximum nesting depth of `<outline>` elements accepted on import.
const MAX_OPML_DEPTH: usize = 50;

/// Title written into the `<head>` of exported documents.
const EXPORT_TITLE: &str = "My RSS Feeds";

#[derive(Debug, Error)]
pub enum OpmlError {
    #[error("XML parse error: {0}")]
    XmlParse(String),

    #[error("OPML nesting depth exceeds maximum of {0} levels")]
    MaxDepthExceeded(usize),

    #[error("Failed to write OPML: {0}")]
    Write(#[from] std::io::Error),
}

/// One subscription line of an OPML document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpmlOutline {
    pub title: Option<String>,
    pub xml_url: String,
}

impl From<&Feed> for OpmlOutline {
    fn from(feed: &Feed) -> Self {
        Self {
            title: feed.title.clone(),
            xml_url: feed.url.clone(),
        }
    }
}

/// Serialize outlines as a compact OPML 2.0 document.
///
/// The layout is fixed: no indentation, and `<body>` sits inside `<head>`
/// after the title, which existing consumers of the export expect.
/// `text`/`title` are left out for outlines without a title.
pub fn export_opml(outlines: &[OpmlOutline]) -> Result<String, OpmlError> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));

    writer.write_event(Event::Decl(BytesDecl::new("1.0", None, None)))?;

    let mut opml = BytesStart::new("opml");
    opml.push_attribute(("version", "2.0"));
    writer.write_event(Event::Start(opml))?;
    writer.write_event(Event::Start(BytesStart::new("head")))?;
    writer.write_event(Event::Start(BytesStart::new("title")))?;
    writer.write_event(Event::Text(BytesText::new(EXPORT_TITLE)))?;
    writer.write_event(Event::End(BytesEnd::new("title")))?;
    writer.write_event(Event::Start(BytesStart::new("body")))?;

    for outline in outlines {
        let mut element = BytesStart::new("outline");
        element.push_attribute(("type", "rss"));
        if let Some(title) = outline.title.as_deref() {
            element.push_attribute(("text", title));
            element.push_attribute(("title", title));
        }
        element.push_attribute(("xmlUrl", outline.xml_url.as_str()));
        writer.write_event(Event::Empty(element))?;
    }

    writer.write_event(Event::End(BytesEnd::new("body")))?;
    writer.write_event(Event::End(BytesEnd::new("head")))?;
    writer.write_event(Event::End(BytesEnd::new("opml")))?;

    let bytes = writer.into_inner().into_inner();
    String::from_utf8(bytes)
        .map_err(|e| OpmlError::Write(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
}

/// Extract every `<outline>` carrying an `xmlUrl`, at any nesting level.
///
/// Category outlines without `xmlUrl` are walked through but not returned.
/// The title comes from `title`, falling back to `text`. URLs are returned
/// as written; validating them is up to the caller.
///
/// Only the predefined XML entities are resolved, so documents cannot pull
/// in external entities.
pub fn parse_opml(content: &str) -> Result<Vec<OpmlOutline>, OpmlError> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut outlines = Vec::new();
    let mut depth: usize = 0;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.name().as_ref() == b"outline" => {
                depth += 1;
                if depth > MAX_OPML_DEPTH {
                    return Err(OpmlError::MaxDepthExceeded(MAX_OPML_DEPTH));
                }
                outlines.extend(read_outline(&e, &reader)?);
            }
            Ok(Event::Empty(e)) if e.name().as_ref() == b"outline" => {
                outlines.extend(read_outline(&e, &reader)?);
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"outline" => {
                depth = depth.saturating_sub(1);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(OpmlError::XmlParse(e.to_string())),
            _ => {}
        }
    }

    Ok(outlines)
}

fn read_outline(
    element: &BytesStart<'_>,
    reader: &Reader<&[u8]>,
) -> Result<Option<OpmlOutline>, OpmlError> {
    let mut xml_url = None;
    let mut title = None;
    let mut text = None;

    for attr in element.attributes() {
        let attr = match attr {
            Ok(attr) => attr,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed OPML attribute");
                continue;
            }
        };
        let value = || -> Result<String, OpmlError> {
            attr.decode_and_unescape_value(reader.decoder())
                .map(|v| v.trim().to_owned())
                .map_err(|e| OpmlError::XmlParse(e.to_string()))
        };
        match attr.key.as_ref() {
            b"xmlUrl" => xml_url = Some(value()?),
            b"title" => title = Some(value()?),
            b"text" => text = Some(value()?),
            _ => {}
        }
    }

    Ok(xml_url.filter(|url| !url.is_empty()).map(|xml_url| OpmlOutline {
        title: title.filter(|t| !t.is_empty()).or(text.filter(|t| !t.is_empty())),
        xml_url,
    }))
}

/// Write an export to `path` atomically.
///
/// The document goes to a uniquely named sibling file first, is synced, and
/// then renamed over the destination, so readers never see a partial file.
pub fn write_to_file(content: &str, path: &Path) -> Result<(), OpmlError> {
    use std::io::Write;

    let temp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));

    let result = (|| {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&temp_path, path)
    })();

    if let Err(e) = result {
        let _ = std::fs::remove_file(&temp_path);
        return Err(OpmlError::Write(e));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn outline(title: Option<&str>, url: &str) -> OpmlOutline {
        OpmlOutline {
            title: title.map(str::to_owned),
            xml_url: url.to_owned(),
        }
    }

    #[test]
    fn test_export_exact_document() {
        let opml = export_opml(&[
            outline(Some("CleanTechnica"), "https://cleantechnica.com/feed/"),
            outline(Some("Jay Alammar"), "http://jalammar.github.io/feed.xml"),
        ])
        .unwrap();

        assert_eq!(
            opml,
            r#"<?xml version="1.0"?><opml version="2.0"><head><title>My RSS Feeds</title><body><outline type="rss" text="CleanTechnica" title="CleanTechnica" xmlUrl="https://cleantechnica.com/feed/"/><outline type="rss" text="Jay Alammar" title="Jay Alammar" xmlUrl="http://jalammar.github.io/feed.xml"/></body></head></opml>"#
        );
    }

    #[test]
    fn test_export_empty() {
        assert_eq!(
            export_opml(&[]).unwrap(),
            r#"<?xml version="1.0"?><opml version="2.0"><head><title>My RSS Feeds</title><body></body></head></opml>"#
        );
    }

    #[test]
    fn test_export_omits_missing_title_and_escapes() {
        let opml = export_opml(&[
            outline(None, "https://example.com/rss"),
            outline(Some("Q&A <weekly>"), "https://example.com/?a=1&b=2"),
        ])
        .unwrap();

        assert!(opml.contains(r#"<outline type="rss" xmlUrl="https://example.com/rss"/>"#));
        assert!(opml.contains(r#"title="Q&amp;A &lt;weekly&gt;""#));
        assert!(opml.contains(r#"xmlUrl="https://example.com/?a=1&amp;b=2""#));
    }

    #[test]
    fn test_parse_nested_outlines() {
        let content = r#"<?xml version="1.0" encoding="UTF-8"?>
<opml version="2.0">
  <head><title>Subscriptions</title></head>
  <body>
    <outline text="Tech">
      <outline text="Jay Alammar" type="rss" xmlUrl="http://jalammar.github.io/feed.xml"/>
      <outline text="Energy">
        <outline title="CleanTechnica" text="ignored" xmlUrl="https://cleantechnica.com/feed/"/>
      </outline>
    </outline>
    <outline xmlUrl="https://example.com/?a=1&amp;b=2"/>
  </body>
</opml>"#;

        let outlines = parse_opml(content).unwrap();
        assert_eq!(
            outlines,
            vec![
                outline(Some("Jay Alammar"), "http://jalammar.github.io/feed.xml"),
                outline(Some("CleanTechnica"), "https://cleantechnica.com/feed/"),
                outline(None, "https://example.com/?a=1&b=2"),
            ]
        );
    }

    #[test]
    fn test_parse_reads_back_export() {
        let exported = export_opml(&[
            outline(Some("CleanTechnica"), "https://cleantechnica.com/feed/"),
            outline(None, "http://jalammar.github.io/feed.xml"),
        ])
        .unwrap();

        let parsed = parse_opml(&exported).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].title.as_deref(), Some("CleanTechnica"));
        assert_eq!(parsed[1].title, None);
    }

    #[test]
    fn test_parse_rejects_deep_nesting() {
        let mut content = String::from("<opml><body>");
        for _ in 0..=MAX_OPML_DEPTH {
            content.push_str("<outline text=\"x\">");
        }
        for _ in 0..=MAX_OPML_DEPTH {
            content.push_str("</outline>");
        }
        content.push_str("</body></opml>");

        assert!(matches!(
            parse_opml(&content),
            Err(OpmlError::MaxDepthExceeded(MAX_OPML_DEPTH))
        ));
    }

    #[test]
    fn test_parse_rejects_malformed_xml() {
        let result = parse_opml("<opml><body><outline xmlUrl=\"a\"></body></opml>");
        assert!(matches!(result, Err(OpmlError::XmlParse(_))));
    }

    #[test]
    fn test_parse_rejects_custom_entities() {
        let content = r#"<?xml version="1.0"?>
<!DOCTYPE opml [<!ENTITY xxe SYSTEM "file:///etc/passwd">]>
<opml><body><outline title="&xxe;" xmlUrl="https://example.com/rss"/></body></opml>"#;
        assert!(parse_opml(content).is_err());
    }

    #[test]
    fn test_write_to_file_replaces_atomically() {
        let dir = std::env::temp_dir().join(format!("feedbox_opml_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("feeds.opml");

        write_to_file("first", &path).unwrap();
        write_to_file("second", &path).unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
        let leftovers = std::fs::read_dir(&dir).unwrap().count();
        assert_eq!(leftovers, 1, "temporary files must not be left behind");

        std::fs::remove_dir_all(&dir).ok();
    }
}
