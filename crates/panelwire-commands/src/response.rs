//! Response inspection.
//!
//! The service answers with small XML documents rooted at `PET`. A
//! [`Response`] keeps the raw body and parses it at most once, on the first
//! element lookup.

use once_cell::sync::OnceCell;
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use tracing::warn;

use crate::command::CommandRef;
use crate::error::ResponseError;

/// Result code of a terminal successful answer.
pub const RESULT_OK: &str = "OK";
/// Result code of a pending answer.
pub const RESULT_WAIT: &str = "WAIT";
/// Result code of a service-reported failure.
pub const RESULT_ERROR: &str = "ERROR";

/// A named location in a response document.
///
/// Paths are absolute element paths such as `/PET/RES`, or address an
/// attribute of an element as in `/PET/INSTALLATION/@alias`.
pub trait Element: Send + Sync {
    /// Name used in error messages.
    fn name(&self) -> &'static str;

    /// Location of the value.
    fn path(&self) -> &'static str;
}

/// Elements shared by every answer of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommonElement {
    Hash,
    Installation,
    Language,
    Ibs,
    Status,
    Sim,
    Message,
    Error,
    Result,
}

impl Element for CommonElement {
    fn name(&self) -> &'static str {
        match self {
            CommonElement::Hash => "HASH",
            CommonElement::Installation => "INSTALLATION",
            CommonElement::Language => "LANGUAGE",
            CommonElement::Ibs => "IBS",
            CommonElement::Status => "STATUS",
            CommonElement::Sim => "SIM",
            CommonElement::Message => "MESSAGE",
            CommonElement::Error => "ERROR",
            CommonElement::Result => "RESULT",
        }
    }

    fn path(&self) -> &'static str {
        match self {
            CommonElement::Hash => "/PET/HASH",
            CommonElement::Installation => "/PET/NUMINST",
            CommonElement::Language => "/PET/LANG",
            CommonElement::Ibs => "/PET/INSTIBUS",
            CommonElement::Status => "/PET/STATUS",
            CommonElement::Sim => "/PET/SIM",
            CommonElement::Message => "/PET/MSG",
            CommonElement::Error => "/PET/ERR",
            CommonElement::Result => "/PET/RES",
        }
    }
}

/// Parse failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DocumentError {
    #[error("Malformed document: {0}")]
    Malformed(String),

    #[error("Unclosed element {0}")]
    Unclosed(String),

    #[error("Document has no root element")]
    Empty,
}

#[derive(Debug)]
struct Node {
    path: String,
    text: String,
    attributes: Vec<(String, String)>,
}

/// Owned element tree flattened in document order.
#[derive(Debug)]
pub struct Document {
    nodes: Vec<Node>,
}

impl Document {
    /// Parse a response body.
    pub fn parse(content: &str) -> Result<Self, DocumentError> {
        let mut reader = Reader::from_str(content);
        reader.config_mut().trim_text(true);

        let mut nodes: Vec<Node> = Vec::new();
        let mut stack: Vec<usize> = Vec::new();

        loop {
            match reader.read_event() {
                Ok(Event::Start(start)) => {
                    let index = Self::open(&mut nodes, &stack, &start)?;
                    stack.push(index);
                }
                Ok(Event::Empty(start)) => {
                    Self::open(&mut nodes, &stack, &start)?;
                }
                Ok(Event::End(_)) => {
                    stack.pop();
                }
                Ok(Event::Text(text)) => {
                    let text = text
                        .unescape()
                        .map_err(|e| DocumentError::Malformed(e.to_string()))?;
                    if let Some(node) = stack.last().and_then(|&i| nodes.get_mut(i)) {
                        node.text.push_str(&text);
                    }
                }
                Ok(Event::CData(data)) => {
                    if let Some(node) = stack.last().and_then(|&i| nodes.get_mut(i)) {
                        node.text.push_str(&String::from_utf8_lossy(&data.into_inner()));
                    }
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => return Err(DocumentError::Malformed(e.to_string())),
            }
        }

        if let Some(node) = stack.last().and_then(|&i| nodes.get(i)) {
            return Err(DocumentError::Unclosed(node.path.clone()));
        }
        if nodes.is_empty() {
            return Err(DocumentError::Empty);
        }

        Ok(Self { nodes })
    }

    fn open(
        nodes: &mut Vec<Node>,
        stack: &[usize],
        start: &BytesStart<'_>,
    ) -> Result<usize, DocumentError> {
        let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        let parent = stack
            .last()
            .and_then(|&i| nodes.get(i))
            .map(|n| n.path.as_str())
            .unwrap_or("");
        let path = format!("{}/{}", parent, name);

        let mut attributes = Vec::new();
        for attribute in start.attributes() {
            let attribute = attribute.map_err(|e| DocumentError::Malformed(e.to_string()))?;
            let key = String::from_utf8_lossy(attribute.key.as_ref()).into_owned();
            let value = attribute
                .unescape_value()
                .map_err(|e| DocumentError::Malformed(e.to_string()))?
                .into_owned();
            attributes.push((key, value));
        }

        nodes.push(Node {
            path,
            text: String::new(),
            attributes,
        });
        Ok(nodes.len() - 1)
    }

    /// Value at a path, first match in document order.
    pub fn lookup(&self, path: &str) -> Option<&str> {
        match path.rsplit_once("/@") {
            Some((element, attribute)) => self
                .nodes
                .iter()
                .filter(|n| n.path == element)
                .find_map(|n| {
                    n.attributes
                        .iter()
                        .find(|(k, _)| k == attribute)
                        .map(|(_, v)| v.as_str())
                }),
            None => self
                .nodes
                .iter()
                .find(|n| n.path == path)
                .map(|n| n.text.as_str()),
        }
    }
}

/// Answer of the service to one request.
#[derive(Debug)]
pub struct Response {
    command: CommandRef,
    content: String,
    document: OnceCell<Option<Document>>,
}

impl Response {
    /// Wrap a raw body received for `command`.
    pub fn new(command: CommandRef, content: impl Into<String>) -> Self {
        Self {
            command,
            content: content.into(),
            document: OnceCell::new(),
        }
    }

    /// Command this response answers.
    pub fn command(&self) -> CommandRef {
        self.command
    }

    /// Raw body.
    pub fn content(&self) -> &str {
        &self.content
    }

    fn document(&self) -> Option<&Document> {
        self.document
            .get_or_init(|| match Document::parse(&self.content) {
                Ok(document) => Some(document),
                Err(e) => {
                    warn!(command = self.command.name(), error = %e, "Unparsable response");
                    None
                }
            })
            .as_ref()
    }

    /// Value of an element.
    pub fn get(&self, element: &dyn Element) -> Result<String, ResponseError> {
        self.document()
            .and_then(|d| d.lookup(element.path()))
            .map(str::to_string)
            .ok_or(ResponseError::MissingElement(element.name()))
    }

    /// Whether the result code is `OK`.
    pub fn success(&self) -> bool {
        self.result().is_ok_and(|r| r == RESULT_OK)
    }

    pub fn result(&self) -> Result<String, ResponseError> {
        self.get(&CommonElement::Result)
    }

    pub fn message(&self) -> Result<String, ResponseError> {
        self.get(&CommonElement::Message)
    }

    pub fn error(&self) -> Result<String, ResponseError> {
        self.get(&CommonElement::Error)
    }

    pub fn status(&self) -> Result<String, ResponseError> {
        self.get(&CommonElement::Status)
    }

    pub fn language(&self) -> Result<String, ResponseError> {
        self.get(&CommonElement::Language)
    }

    pub fn installation(&self) -> Result<String, ResponseError> {
        self.get(&CommonElement::Installation)
    }

    /// Session token.
    pub fn hash(&self) -> Result<String, ResponseError> {
        self.get(&CommonElement::Hash)
    }

    pub fn sim(&self) -> Result<String, ResponseError> {
        self.get(&CommonElement::Sim)
    }

    /// Installation bus identifier.
    pub fn ibs(&self) -> Result<String, ResponseError> {
        self.get(&CommonElement::Ibs)
    }
}
