//! Record preview.
//!
//! Scans the beginning of a document for the first structured element
//! (one with attributes or children), reports its tag as the inferred
//! record tag, flattens it, and re-serializes it as an XML sample.

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use serde::Serialize;
use std::io::{BufReader, Read};

use super::{RecordReader, RecordSelector, DEFAULT_MAX_DEPTH};
use crate::error::{ParseError, ParseResult, RenderError};
use crate::models::{Element, EmptyLeafPolicy, FlatRow};
use crate::transform::flatten::flatten_record;

/// Default number of bytes sampled for a preview (40 KiB).
pub const DEFAULT_PREVIEW_BYTES: u64 = 40 * 1024;

/// Result of previewing a document.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Preview {
    /// Inferred record tag, `None` when no structured element was found.
    pub record_tag: Option<String>,
    /// Sorted columns of the sample record.
    pub columns: Vec<String>,
    /// Flattened sample record.
    pub row: Option<FlatRow>,
    /// Sample record rendered back to XML.
    pub xml_sample: Option<String>,
    /// The byte limit cut the document before a record was found.
    pub truncated: bool,
}

impl Preview {
    fn empty(truncated: bool) -> Self {
        Self {
            record_tag: None,
            columns: Vec::new(),
            row: None,
            xml_sample: None,
            truncated,
        }
    }

    fn from_element(element: &Element, policy: EmptyLeafPolicy) -> Self {
        let row = flatten_record(element, policy);
        Self {
            record_tag: Some(element.tag.clone()),
            columns: row.sorted_columns(),
            row: Some(row),
            xml_sample: match element_to_xml(element) {
                Ok(xml) => Some(xml),
                Err(e) => {
                    log::warn!("Cannot render <{}> sample: {}", element.tag, e);
                    None
                }
            },
            truncated: false,
        }
    }
}

/// Preview `input`, reading at most `limit` bytes when given.
///
/// When the limit cuts the document inside an open element or inside markup
/// before the first record completes, the preview is empty and marked
/// `truncated`. Any other error inside the sample is fatal.
pub fn preview_reader<R: Read>(
    input: R,
    limit: Option<u64>,
    policy: EmptyLeafPolicy,
    max_depth: usize,
) -> ParseResult<Preview> {
    match limit {
        Some(limit) => {
            let mut records = RecordReader::new(BufReader::new(input.take(limit)), RecordSelector::FirstStructured)
                .with_max_depth(max_depth);
            let first = records.next();
            let exhausted = records.into_inner().into_inner().limit() == 0;
            match first {
                Some(Ok(element)) => Ok(Preview::from_element(&element, policy)),
                Some(Err(ParseError::UnclosedElements { .. } | ParseError::UnclosedMarkup { .. })) if exhausted => {
                    log::debug!("Preview sample of {} bytes ended before a record completed", limit);
                    Ok(Preview::empty(true))
                }
                Some(Err(e)) => Err(e),
                None => Ok(Preview::empty(exhausted)),
            }
        }
        None => {
            let mut records =
                RecordReader::new(BufReader::new(input), RecordSelector::FirstStructured).with_max_depth(max_depth);
            match records.next() {
                Some(Ok(element)) => Ok(Preview::from_element(&element, policy)),
                Some(Err(e)) => Err(e),
                None => Ok(Preview::empty(false)),
            }
        }
    }
}

/// Preview with default sample size and depth.
pub fn preview_bytes(xml: &[u8]) -> ParseResult<Preview> {
    preview_reader(xml, Some(DEFAULT_PREVIEW_BYTES), EmptyLeafPolicy::Skip, DEFAULT_MAX_DEPTH)
}

/// Render an element subtree as indented XML.
pub fn element_to_xml(element: &Element) -> Result<String, RenderError> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    write_element(&mut writer, element)?;
    Ok(String::from_utf8(writer.into_inner())?)
}

fn write_element(writer: &mut Writer<Vec<u8>>, element: &Element) -> Result<(), RenderError> {
    let mut start = BytesStart::new(element.tag.as_str());
    for (name, value) in &element.attributes {
        start.push_attribute((name.as_str(), value.as_str()));
    }

    if element.text.is_none() && element.children.is_empty() {
        writer.write_event(Event::Empty(start))?;
        return Ok(());
    }

    writer.write_event(Event::Start(start))?;
    if let Some(text) = &element.text {
        writer.write_event(Event::Text(BytesText::new(text)))?;
    }
    for child in &element.children {
        write_element(writer, child)?;
    }
    writer.write_event(Event::End(BytesEnd::new(element.tag.as_str())))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const FEED: &str = r#"<?xml version="1.0"?>
<Catalog>
  <Product id="1"><Name>Widget</Name><Tags><Tag>a</Tag></Tags></Product>
  <Product id="2"><Name>Gadget</Name></Product>
</Catalog>"#;

    #[test]
    fn test_preview_infers_tag_and_columns() {
        let preview = preview_bytes(FEED.as_bytes()).unwrap();

        // <Tags> completes first and has a child.
        assert_eq!(preview.record_tag.as_deref(), Some("Tags"));
        assert_eq!(preview.columns, vec!["Tags_Tag"]);
        assert!(!preview.truncated);
    }

    #[test]
    fn test_preview_of_flat_records() {
        let xml = "<Catalog><Product><Name>Widget</Name><Price>9</Price></Product></Catalog>";
        let preview = preview_bytes(xml.as_bytes()).unwrap();

        assert_eq!(preview.record_tag.as_deref(), Some("Product"));
        assert_eq!(preview.columns, vec!["Product_Name", "Product_Price"]);
        let row = preview.row.unwrap();
        assert_eq!(row.get("Product_Name"), Some("Widget"));
    }

    #[test]
    fn test_preview_xml_sample() {
        let xml = r#"<Catalog><Product id="1"><Name>A &amp; B</Name><Empty/></Product></Catalog>"#;
        let preview = preview_bytes(xml.as_bytes()).unwrap();
        let sample = preview.xml_sample.unwrap();

        assert!(sample.starts_with(r#"<Product id="1">"#));
        assert!(sample.contains("<Name>A &amp; B</Name>"));
        assert!(sample.contains("<Empty/>"));
        assert!(sample.trim_end().ends_with("</Product>"));
    }

    #[test]
    fn test_preview_truncated_sample_is_not_an_error() {
        let xml = "<Catalog><Product><Name>Widget</Name><Description>long text";
        let preview = preview_reader(xml.as_bytes(), Some(30), EmptyLeafPolicy::Skip, DEFAULT_MAX_DEPTH).unwrap();
        assert!(preview.record_tag.is_none());
        assert!(preview.truncated);
    }

    #[test]
    fn test_preview_malformed_sample_is_an_error() {
        let xml = "<Catalog><Product><Name>Widget</Nmae></Product></Catalog>";
        let result = preview_reader(xml.as_bytes(), Some(4096), EmptyLeafPolicy::Skip, DEFAULT_MAX_DEPTH);
        assert!(result.is_err());
    }

    #[test]
    fn test_sample_cut_inside_comment_is_truncated() {
        let xml = format!("<!-- {} --><Catalog><Product><Name>Widget</Name></Product></Catalog>", "c".repeat(100));
        let preview = preview_reader(xml.as_bytes(), Some(50), EmptyLeafPolicy::Skip, DEFAULT_MAX_DEPTH).unwrap();
        assert!(preview.record_tag.is_none());
        assert!(preview.truncated);
    }

    #[test]
    fn test_mismatch_at_end_of_sample_is_an_error() {
        let xml = "<Catalog><Product><Name>Widget</Nmae>";
        let result = preview_reader(xml.as_bytes(), Some(xml.len() as u64), EmptyLeafPolicy::Skip, DEFAULT_MAX_DEPTH);
        assert!(matches!(result, Err(ParseError::MismatchedEndTag { .. })));
    }

    #[test]
    fn test_element_to_xml_escapes_values() {
        let element = Element {
            tag: "Item".into(),
            attributes: vec![("note".into(), "a\"b".into())],
            text: Some("1 < 2".into()),
            children: Vec::new(),
        };
        let xml = element_to_xml(&element).unwrap();
        assert_eq!(xml, r#"<Item note="a&quot;b">1 &lt; 2</Item>"#);
    }

    #[test]
    fn test_preview_without_structure() {
        let preview = preview_bytes(b"<Note>just text</Note>").unwrap();
        assert!(preview.record_tag.is_none());
        assert!(preview.row.is_none());
        assert!(!preview.truncated);
    }
}
