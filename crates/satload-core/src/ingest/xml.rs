use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::{Map, Value};
use thiserror::Error;

/// Key prefix for attributes in the converted tree.
pub const ATTRIBUTE_PREFIX: char = '@';
/// Key holding character data of mixed-content elements.
pub const TEXT_KEY: &str = "#text";
/// Key holding the XML declaration.
pub const DECLARATION_KEY: &str = "?xml";

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Malformed XML: {0}")]
    Malformed(#[from] quick_xml::Error),
    #[error("Malformed XML attribute: {0}")]
    Attribute(#[from] quick_xml::events::attributes::AttrError),
    #[error("Document has no root element")]
    NoRoot,
    #[error("Document has more than one root element")]
    MultipleRoots,
    #[error("Unclosed element <{0}>")]
    Unclosed(String),
    #[error("Text outside of the root element")]
    StrayText,
}

pub type ParseResult<T> = Result<T, ParseError>;

/// Converts an XML document into a JSON tree.
///
/// Elements become objects keyed by their qualified name (namespace prefixes
/// are kept, so `cfdi:Emisor` stays `cfdi:Emisor`). Attributes become `@name`
/// keys. An element holding only text becomes a string, an empty element
/// becomes `null`, and repeated sibling elements collapse into an array.
pub fn to_tree(xml: &str) -> ParseResult<Value> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut document = Map::new();
    let mut stack: Vec<(String, Map<String, Value>)> = Vec::new();
    let mut has_root = false;

    loop {
        match reader.read_event()? {
            Event::Decl(decl) => {
                let mut attrs = Map::new();
                let version = decl.version()?;
                attrs.insert(
                    "@version".into(),
                    Value::String(String::from_utf8_lossy(&version).into_owned()),
                );
                if let Some(encoding) = decl.encoding() {
                    attrs.insert(
                        "@encoding".into(),
                        Value::String(String::from_utf8_lossy(&encoding?).into_owned()),
                    );
                }
                if let Some(standalone) = decl.standalone() {
                    attrs.insert(
                        "@standalone".into(),
                        Value::String(String::from_utf8_lossy(&standalone?).into_owned()),
                    );
                }
                document.insert(DECLARATION_KEY.into(), Value::Object(attrs));
            }
            Event::Start(start) => {
                if stack.is_empty() && has_root {
                    return Err(ParseError::MultipleRoots);
                }
                let (name, attrs) = open_element(&start)?;
                stack.push((name, attrs));
            }
            Event::Empty(start) => {
                let (name, attrs) = open_element(&start)?;
                let value = finish_element(attrs);
                match stack.last_mut() {
                    Some((_, parent)) => insert_child(parent, name, value),
                    None if has_root => return Err(ParseError::MultipleRoots),
                    None => {
                        document.insert(name, value);
                        has_root = true;
                    }
                }
            }
            Event::End(_) => {
                // quick-xml has already checked that the end tag matches.
                let Some((name, attrs)) = stack.pop() else {
                    return Err(ParseError::NoRoot);
                };
                let value = finish_element(attrs);
                match stack.last_mut() {
                    Some((_, parent)) => insert_child(parent, name, value),
                    None => {
                        document.insert(name, value);
                        has_root = true;
                    }
                }
            }
            Event::Text(text) => {
                let text = text.unescape()?;
                append_text(&mut stack, &text)?;
            }
            Event::CData(data) => {
                let text = String::from_utf8_lossy(&data.into_inner()).into_owned();
                append_text(&mut stack, &text)?;
            }
            Event::Eof => break,
            Event::Comment(_) | Event::PI(_) | Event::DocType(_) => {}
        }
    }

    if let Some((name, _)) = stack.pop() {
        return Err(ParseError::Unclosed(name));
    }
    if !has_root {
        return Err(ParseError::NoRoot);
    }

    Ok(Value::Object(document))
}

/// Walks nested object keys and returns the string at the end of the path.
///
/// Lookups are exact and case-sensitive. Arrays are not traversed, so a path
/// through a repeated element does not resolve.
pub fn lookup_str<'a>(tree: &'a Value, path: &[&str]) -> Option<&'a str> {
    path.iter()
        .try_fold(tree, |node, key| node.as_object()?.get(*key))?
        .as_str()
}

fn open_element(start: &BytesStart<'_>) -> ParseResult<(String, Map<String, Value>)> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut attrs = Map::new();
    for attr in start.attributes() {
        let attr = attr?;
        let key = format!(
            "{ATTRIBUTE_PREFIX}{}",
            String::from_utf8_lossy(attr.key.as_ref())
        );
        let value = attr.unescape_value()?.into_owned();
        attrs.insert(key, Value::String(value));
    }
    Ok((name, attrs))
}

fn finish_element(mut fields: Map<String, Value>) -> Value {
    if fields.is_empty() {
        return Value::Null;
    }
    if fields.len() == 1 {
        if let Some(text) = fields.remove(TEXT_KEY) {
            return text;
        }
    }
    Value::Object(fields)
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

fn append_text(stack: &mut [(String, Map<String, Value>)], text: &str) -> ParseResult<()> {
    if text.is_empty() {
        return Ok(());
    }
    let Some((_, fields)) = stack.last_mut() else {
        return Err(ParseError::StrayText);
    };
    match fields.get_mut(TEXT_KEY) {
        Some(Value::String(existing)) => existing.push_str(text),
        _ => {
            fields.insert(TEXT_KEY.into(), Value::String(text.to_string()));
        }
    }
    Ok(())
}
