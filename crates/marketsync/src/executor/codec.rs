//! Request/response body codec.
//!
//! Both JSON and XML bodies normalize to `serde_json::Value`. XML maps as:
//! attributes to `@name` keys, repeated child elements to arrays, mixed text
//! to `#text`, and leaf text to strings. Namespace prefixes are dropped.

use std::borrow::Cow;

use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use serde_json::{Map, Value};

use super::errors::{ExecutorError, Result};
use crate::settings::BodyFormat;

impl BodyFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            BodyFormat::Json => "application/json",
            BodyFormat::Xml => "application/xml",
        }
    }
}

/// Serialize a request payload.
pub fn encode(format: BodyFormat, xml_root: &str, payload: &Value) -> Result<Vec<u8>> {
    match format {
        BodyFormat::Json => serde_json::to_vec(payload).map_err(encode_err),
        BodyFormat::Xml => {
            let mut writer = Writer::new(Vec::new());
            write_element(&mut writer, xml_root, payload)?;
            Ok(writer.into_inner())
        }
    }
}

/// Parse a response body. A `Content-Type` header, when present, wins over
/// the marketplace's configured format. Empty bodies decode to `null`.
pub fn decode(format: BodyFormat, content_type: Option<&str>, body: &[u8]) -> Result<Value> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    let format = match content_type.map(str::to_ascii_lowercase) {
        Some(ct) if ct.contains("json") => BodyFormat::Json,
        Some(ct) if ct.contains("xml") => BodyFormat::Xml,
        _ => format,
    };
    match format {
        BodyFormat::Json => serde_json::from_slice(body)
            .map_err(|e| ExecutorError::malformed(format!("invalid JSON body: {}", e))),
        BodyFormat::Xml => decode_xml(body),
    }
}

/// Lossy text of a body for error messages and logs.
pub fn snippet(body: &[u8], max: usize) -> String {
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

fn encode_err(e: impl std::fmt::Display) -> ExecutorError {
    ExecutorError::Encode(e.to_string())
}

fn scalar_text(value: &Value) -> Cow<'_, str> {
    match value {
        Value::String(s) => Cow::Borrowed(s.as_str()),
        Value::Null => Cow::Borrowed(""),
        other => Cow::Owned(other.to_string()),
    }
}

fn write_element(writer: &mut Writer<Vec<u8>>, name: &str, value: &Value) -> Result<()> {
    match value {
        Value::Array(items) => {
            for item in items {
                write_element(writer, name, item)?;
            }
        }
        Value::Object(map) => {
            let mut start = BytesStart::new(name);
            for (key, v) in map {
                if let Some(attr) = key.strip_prefix('@') {
                    start.push_attribute((attr, scalar_text(v).as_ref()));
                }
            }
            writer.write_event(Event::Start(start)).map_err(encode_err)?;
            for (key, v) in map {
                if key == "#text" {
                    writer
                        .write_event(Event::Text(BytesText::new(&scalar_text(v))))
                        .map_err(encode_err)?;
                } else if !key.starts_with('@') {
                    write_element(writer, key, v)?;
                }
            }
            writer
                .write_event(Event::End(BytesEnd::new(name)))
                .map_err(encode_err)?;
        }
        Value::Null => {
            writer
                .write_event(Event::Empty(BytesStart::new(name)))
                .map_err(encode_err)?;
        }
        scalar => {
            writer
                .write_event(Event::Start(BytesStart::new(name)))
                .map_err(encode_err)?;
            writer
                .write_event(Event::Text(BytesText::new(&scalar_text(scalar))))
                .map_err(encode_err)?;
            writer
                .write_event(Event::End(BytesEnd::new(name)))
                .map_err(encode_err)?;
        }
    }
    Ok(())
}

struct Frame {
    name: String,
    fields: Map<String, Value>,
    text: String,
}

impl Frame {
    fn open(start: &BytesStart<'_>) -> Result<Self> {
        let mut fields = Map::new();
        for attr in start.attributes() {
            let attr = attr.map_err(|e| ExecutorError::malformed(format!("invalid XML attribute: {}", e)))?;
            if attr.key.as_ref().starts_with(b"xmlns") {
                continue;
            }
            let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
            let value = attr.unescape_value().map_err(xml_err)?;
            fields.insert(format!("@{}", key), Value::String(value.into_owned()));
        }
        Ok(Self {
            name: String::from_utf8_lossy(start.local_name().as_ref()).into_owned(),
            fields,
            text: String::new(),
        })
    }

    fn close(self) -> (String, Value) {
        let text = self.text.trim().to_string();
        let value = match (self.fields.is_empty(), text.is_empty()) {
            (true, true) => Value::Null,
            (true, false) => Value::String(text),
            (false, true) => Value::Object(self.fields),
            (false, false) => {
                let mut fields = self.fields;
                fields.insert("#text".to_string(), Value::String(text));
                Value::Object(fields)
            }
        };
        (self.name, value)
    }
}

fn xml_err(e: impl std::fmt::Display) -> ExecutorError {
    ExecutorError::malformed(format!("invalid XML body: {}", e))
}

fn insert_child(parent: &mut Map<String, Value>, name: String, value: Value) {
    match parent.get_mut(&name) {
        Some(Value::Array(items)) => items.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
        None => {
            parent.insert(name, value);
        }
    }
}

/// Decode an XML document to the value of its root element.
fn decode_xml(body: &[u8]) -> Result<Value> {
    let mut reader = Reader::from_reader(body);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Frame> = Vec::new();
    let mut root: Option<Value> = None;

    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(start) => stack.push(Frame::open(&start)?),
            Event::Empty(start) => {
                let (name, value) = Frame::open(&start)?.close();
                match stack.last_mut() {
                    Some(parent) => insert_child(&mut parent.fields, name, value),
                    None => root = Some(value),
                }
            }
            Event::Text(text) => {
                if let Some(frame) = stack.last_mut() {
                    frame.text.push_str(&text.unescape().map_err(xml_err)?);
                }
            }
            Event::CData(data) => {
                if let Some(frame) = stack.last_mut() {
                    frame.text.push_str(&String::from_utf8_lossy(&data.into_inner()));
                }
            }
            Event::End(_) => {
                let frame = stack
                    .pop()
                    .ok_or_else(|| ExecutorError::malformed("unbalanced XML end tag"))?;
                let (name, value) = frame.close();
                match stack.last_mut() {
                    Some(parent) => insert_child(&mut parent.fields, name, value),
                    None => root = Some(value),
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(ExecutorError::malformed("unexpected end of XML document"));
    }
    root.ok_or_else(|| ExecutorError::malformed("XML document has no root element"))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_decode_json() {
        let value = decode(BodyFormat::Json, None, br#"{"batchRequestId":"abc"}"#).unwrap();
        assert_eq!(value, json!({"batchRequestId": "abc"}));
    }

    #[test]
    fn test_decode_empty_body_is_null() {
        assert_eq!(decode(BodyFormat::Json, None, b"  ").unwrap(), Value::Null);
    }

    #[test]
    fn test_decode_invalid_json_is_malformed() {
        let err = decode(BodyFormat::Json, None, b"<html>").unwrap_err();
        assert!(matches!(err, ExecutorError::MalformedResponse(_)));
    }

    #[test]
    fn test_content_type_overrides_configured_format() {
        let value = decode(
            BodyFormat::Xml,
            Some("application/json; charset=utf-8"),
            br#"{"ok":true}"#,
        )
        .unwrap();
        assert_eq!(value, json!({"ok": true}));
    }

    #[test]
    fn test_decode_xml_normalizes_structure() {
        let body = br#"<?xml version="1.0" encoding="UTF-8"?>
            <env:Envelope xmlns:env="http://schemas.xmlsoap.org/soap/envelope/">
              <env:Body>
                <SaveProductResponse>
                  <result status="success"/>
                  <product id="42"><sku>SKU-1</sku><title>Kettle &amp; Cup</title></product>
                  <tag>a</tag>
                  <tag>b</tag>
                  <note lang="tr">merhaba</note>
                </SaveProductResponse>
              </env:Body>
            </env:Envelope>"#;

        let value = decode(BodyFormat::Xml, None, body).unwrap();
        assert_eq!(
            value,
            json!({
                "Body": {
                    "SaveProductResponse": {
                        "result": {"@status": "success"},
                        "product": {"@id": "42", "sku": "SKU-1", "title": "Kettle & Cup"},
                        "tag": ["a", "b"],
                        "note": {"@lang": "tr", "#text": "merhaba"}
                    }
                }
            })
        );
    }

    #[test]
    fn test_decode_truncated_xml_is_malformed() {
        let err = decode(BodyFormat::Xml, None, b"<a><b>1</b>").unwrap_err();
        assert!(matches!(err, ExecutorError::MalformedResponse(_)));
    }

    #[test]
    fn test_encode_xml() {
        let payload = json!({
            "auth": {"@appKey": "k"},
            "product": {"sku": "SKU-1", "price": 10.5, "images": {"image": ["a.jpg", "b.jpg"]}}
        });
        let body = encode(BodyFormat::Xml, "SaveProductRequest", &payload).unwrap();
        let xml = String::from_utf8(body).unwrap();
        assert_eq!(
            xml,
            "<SaveProductRequest><auth appKey=\"k\"></auth><product><images><image>a.jpg</image>\
             <image>b.jpg</image></images><price>10.5</price><sku>SKU-1</sku></product>\
             </SaveProductRequest>"
        );
        // And back.
        let decoded = decode(BodyFormat::Xml, None, xml.as_bytes()).unwrap();
        assert_eq!(decoded["product"]["sku"], json!("SKU-1"));
        assert_eq!(decoded["product"]["images"]["image"], json!(["a.jpg", "b.jpg"]));
    }

    #[test]
    fn test_snippet_truncates() {
        assert_eq!(snippet(b"  short  ", 10), "short");
        assert_eq!(snippet("çççççç".as_bytes(), 3), "ççç...");
    }
}
