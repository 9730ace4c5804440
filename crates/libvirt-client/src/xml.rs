//! Minimal XML reading and writing for libvirt documents
//!
//! libvirt descriptions are small and shallow. Reading flattens a document
//! into `(path, attributes, text)` records so callers can query
//! `volume/target/path` style paths without modelling the whole schema.
//! Writing goes through quick-xml's indenting writer, which escapes
//! attribute values and text.

use crate::error::HypervisorError;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

/// One element of a flattened document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlElement {
    /// Slash-separated path from the root, e.g. `volume/target/path`
    pub path: String,
    /// Attributes in document order
    pub attributes: Vec<(String, String)>,
    /// Concatenated, trimmed text content
    pub text: String,
}

impl XmlElement {
    /// Value of an attribute
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// A parsed XML document
#[derive(Debug, Clone, Default)]
pub struct XmlDocument {
    elements: Vec<XmlElement>,
}

impl XmlDocument {
    /// Parse an XML string
    pub fn parse(xml: &str) -> Result<Self, HypervisorError> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut elements: Vec<XmlElement> = Vec::new();
        let mut names: Vec<String> = Vec::new();
        let mut open: Vec<usize> = Vec::new();

        loop {
            match reader.read_event() {
                Ok(Event::Start(start)) => {
                    let index = push_element(&mut elements, &mut names, &start)?;
                    open.push(index);
                }
                Ok(Event::Empty(start)) => {
                    push_element(&mut elements, &mut names, &start)?;
                    names.pop();
                }
                Ok(Event::End(_)) => {
                    open.pop();
                    names.pop();
                }
                Ok(Event::Text(text)) => {
                    if let Some(&index) = open.last() {
                        let text = text
                            .unescape()
                            .map_err(|e| HypervisorError::Xml(e.to_string()))?;
                        elements[index].text.push_str(&text);
                    }
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => {
                    return Err(HypervisorError::Xml(format!(
                        "error at position {}: {}",
                        reader.error_position(),
                        e
                    )));
                }
            }
        }

        Ok(Self { elements })
    }

    /// First element at `path`
    pub fn first(&self, path: &str) -> Option<&XmlElement> {
        self.elements.iter().find(|element| element.path == path)
    }

    /// All elements at `path`, in document order
    pub fn all<'a>(&'a self, path: &'a str) -> impl Iterator<Item = &'a XmlElement> + 'a {
        self.elements.iter().filter(move |element| element.path == path)
    }

    /// Text of the first element at `path`, if present and non-empty
    pub fn text(&self, path: &str) -> Option<&str> {
        self.first(path)
            .map(|element| element.text.as_str())
            .filter(|text| !text.is_empty())
    }

    /// Attribute of the first element at `path`
    pub fn attr(&self, path: &str, name: &str) -> Option<&str> {
        self.first(path).and_then(|element| element.attr(name))
    }
}

fn push_element(
    elements: &mut Vec<XmlElement>,
    names: &mut Vec<String>,
    start: &BytesStart<'_>,
) -> Result<usize, HypervisorError> {
    names.push(String::from_utf8_lossy(start.name().as_ref()).into_owned());

    let mut attributes = Vec::new();
    for attribute in start.attributes() {
        let attribute = attribute.map_err(|e| HypervisorError::Xml(e.to_string()))?;
        let key = String::from_utf8_lossy(attribute.key.as_ref()).into_owned();
        let value = attribute
            .unescape_value()
            .map_err(|e| HypervisorError::Xml(e.to_string()))?
            .into_owned();
        attributes.push((key, value));
    }

    elements.push(XmlElement {
        path: names.join("/"),
        attributes,
        text: String::new(),
    });
    Ok(elements.len() - 1)
}

/// Indented XML writer on top of quick-xml's `Writer`
pub(crate) struct XmlWriter {
    writer: Writer<Vec<u8>>,
}

impl XmlWriter {
    pub(crate) fn new() -> Self {
        Self {
            writer: Writer::new_with_indent(Vec::new(), b' ', 2),
        }
    }

    fn emit(&mut self, event: Event<'_>) {
        // The sink is a Vec<u8>, writes cannot fail
        let _ = self.writer.write_event(event);
    }

    /// `<name attr="..">`; must be paired with `close`
    pub(crate) fn open(&mut self, name: &str, attributes: &[(&str, &str)]) {
        self.emit(Event::Start(start_tag(name, attributes)));
    }

    pub(crate) fn close(&mut self, name: &str) {
        self.emit(Event::End(BytesEnd::new(name)));
    }

    /// `<name attr=".."/>`
    pub(crate) fn empty(&mut self, name: &str, attributes: &[(&str, &str)]) {
        self.emit(Event::Empty(start_tag(name, attributes)));
    }

    /// `<name attr="..">text</name>`
    pub(crate) fn text(&mut self, name: &str, attributes: &[(&str, &str)], text: &str) {
        self.emit(Event::Start(start_tag(name, attributes)));
        self.emit(Event::Text(BytesText::new(text)));
        self.emit(Event::End(BytesEnd::new(name)));
    }

    pub(crate) fn finish(self) -> String {
        String::from_utf8_lossy(&self.writer.into_inner()).into_owned()
    }
}

fn start_tag<'a>(name: &'a str, attributes: &[(&'a str, &'a str)]) -> BytesStart<'a> {
    BytesStart::new(name).with_attributes(attributes.iter().copied())
}
