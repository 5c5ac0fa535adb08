//! Small namespace-agnostic XML element tree
//!
//! The feature feeds (WFS, SOS) mix half a dozen namespaces whose prefixes
//! vary between servers, so elements and attributes are matched by local
//! name only. Paths are `/`-separated local names; a trailing `@name`
//! segment selects an attribute.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum XmlError {
    #[error("XML syntax error at byte {position}: {message}")]
    Syntax { position: u64, message: String },

    #[error("XML document has no root element")]
    NoRoot,

    #[error("Unbalanced end tag </{0}>")]
    Unbalanced(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Element {
    /// Local name, prefix stripped
    pub name: String,
    /// Attributes by local name
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Element>,
    /// Text directly inside this element
    pub text: String,
}

fn local(name: &str) -> &str {
    name.rsplit(':').next().unwrap_or(name)
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

impl Element {
    /// Parse a complete document and return its root element
    pub fn parse(xml: &str) -> Result<Element, XmlError> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            let syntax = |reader: &Reader<&[u8]>, err: &dyn std::fmt::Display| XmlError::Syntax {
                position: reader.buffer_position() as u64,
                message: err.to_string(),
            };

            match reader.read_event() {
                Ok(Event::Start(e)) => {
                    let element = Self::from_start(&e).map_err(|m| syntax(&reader, &m))?;
                    stack.push(element);
                }
                Ok(Event::Empty(e)) => {
                    let element = Self::from_start(&e).map_err(|m| syntax(&reader, &m))?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(element),
                        None => root = Some(element),
                    }
                }
                Ok(Event::End(e)) => {
                    let element = stack
                        .pop()
                        .ok_or_else(|| XmlError::Unbalanced(lossy(e.local_name().as_ref())))?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(element),
                        None => root = Some(element),
                    }
                }
                Ok(Event::Text(e)) => {
                    let text = e.unescape().map_err(|err| syntax(&reader, &err))?;
                    if let Some(current) = stack.last_mut() {
                        current.text.push_str(&text);
                    }
                }
                Ok(Event::CData(e)) => {
                    if let Some(current) = stack.last_mut() {
                        current.text.push_str(&lossy(&e.into_inner()));
                    }
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(err) => return Err(syntax(&reader, &err)),
            }
        }

        root.ok_or(XmlError::NoRoot)
    }

    fn from_start(start: &BytesStart<'_>) -> Result<Element, String> {
        let mut attributes = Vec::new();
        for attr in start.attributes() {
            let attr = attr.map_err(|e| e.to_string())?;
            let value = attr.unescape_value().map_err(|e| e.to_string())?;
            attributes.push((lossy(attr.key.local_name().as_ref()), value.into_owned()));
        }
        Ok(Element {
            name: lossy(start.local_name().as_ref()),
            attributes,
            children: Vec::new(),
            text: String::new(),
        })
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        let name = local(name);
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn child(&self, name: &str) -> Option<&Element> {
        let name = local(name);
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a, 'n>(
        &'a self,
        name: &'n str,
    ) -> impl Iterator<Item = &'a Element> + 'n
    where
        'a: 'n,
    {
        let name = local(name);
        self.children.iter().filter(move |c| c.name == name)
    }

    /// First element at `path` below this one
    pub fn find(&self, path: &str) -> Option<&Element> {
        path.split('/')
            .filter(|s| !s.is_empty())
            .try_fold(self, |current, segment| current.child(segment))
    }

    /// Every element at `path` below this one, in document order
    pub fn find_all(&self, path: &str) -> Vec<&Element> {
        let mut current = vec![self];
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current = current
                .into_iter()
                .flat_map(|e| {
                    let name = local(segment);
                    e.children.iter().filter(move |c| c.name == name)
                })
                .collect();
        }
        current
    }

    /// First descendant (any depth, depth first) with the given local name
    pub fn descendant(&self, name: &str) -> Option<&Element> {
        let name = local(name);
        self.children.iter().find_map(|c| {
            if c.name == name {
                Some(c)
            } else {
                c.descendant(name)
            }
        })
    }

    /// Concatenated text of this element and all descendants
    pub fn text_content(&self) -> String {
        let mut out = self.text.clone();
        for child in &self.children {
            out.push_str(&child.text_content());
        }
        out
    }

    /// String value of `path`, empty when absent
    ///
    /// `a/b` yields the text content of the first `b` inside `a`;
    /// `a/b/@href` yields the `href` attribute of that `b`.
    pub fn value(&self, path: &str) -> String {
        self.value_opt(path).unwrap_or_default()
    }

    /// Like [`Element::value`], but `None` when the node is absent
    pub fn value_opt(&self, path: &str) -> Option<String> {
        match path.rsplit_once('@') {
            Some((element_path, attribute)) => {
                let element = self.find(element_path.trim_end_matches('/'))?;
                element.attr(attribute).map(str::to_string)
            }
            None => self.find(path).map(Element::text_content),
        }
    }
}

/// Part of a reference URI after the last `/`
pub fn href_tail(href: &str) -> &str {
    href.rsplit('/').next().unwrap_or(href)
}
