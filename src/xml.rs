//! Minimal XML element tree for the coqtop wire dialect.
//!
//! The ide protocol only ever uses plain elements, attributes, text and the
//! five predefined entities, so a full XML implementation buys nothing here.
//! Parsing is strict about well-formedness (matching close tags, terminated
//! entities); anything else is reported as [`ProtocolError::Malformed`].

use std::borrow::Cow;
use std::fmt::Write as _;

use crate::error::ProtocolError;

/// One parsed element: name, attributes in document order, child nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Element {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Node {
    Element(Element),
    Text(String),
}

impl Element {
    /// Value of the named attribute, if present.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Direct element children, in document order.
    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(el) => Some(el),
            Node::Text(_) => None,
        })
    }

    /// First direct child element with the given name.
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.elements().find(|el| el.name == name)
    }

    /// Direct child elements with the given name.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.elements().filter(move |el| el.name == name)
    }

    /// First descendant element with the given name, depth-first.
    /// Does not consider `self`.
    pub fn descendant(&self, name: &str) -> Option<&Element> {
        for el in self.elements() {
            if el.name == name {
                return Some(el);
            }
            if let Some(found) = el.descendant(name) {
                return Some(found);
            }
        }
        None
    }

    /// All text content, concatenated in document order, with only leading
    /// and trailing newline/carriage-return characters stripped.
    pub fn text(&self) -> String {
        let mut out = String::new();
        self.collect_text(&mut out);
        out.trim_matches(['\n', '\r']).to_string()
    }

    fn collect_text(&self, out: &mut String) {
        for node in &self.children {
            match node {
                Node::Text(text) => out.push_str(text),
                Node::Element(el) => el.collect_text(out),
            }
        }
    }
}

/// Some coqtop versions emit a literal `&nbsp;`, which is not a predefined
/// XML entity. Normalize it to an ordinary space before parsing.
pub(crate) fn normalize(input: &str) -> Cow<'_, str> {
    if input.contains("&nbsp;") {
        Cow::Owned(input.replace("&nbsp;", " "))
    } else {
        Cow::Borrowed(input)
    }
}

/// Escape text for insertion as element content or attribute value.
pub(crate) fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

/// Parse a single document (one root element, optionally surrounded by
/// whitespace) into an [`Element`].
pub(crate) fn parse(input: &str) -> Result<Element, ProtocolError> {
    let mut parser = Parser { input, pos: 0 };
    parser.skip_whitespace();
    let root = parser.parse_element()?;
    parser.skip_whitespace();
    if parser.pos != parser.input.len() {
        return Err(malformed(input, "trailing content after root element"));
    }
    Ok(root)
}

fn malformed(input: &str, reason: &str) -> ProtocolError {
    ProtocolError::Malformed(format!("{reason} in {input:?}"))
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl Parser<'_> {
    fn rest(&self) -> &str {
        &self.input[self.pos..]
    }

    fn peek(&self) -> Option<u8> {
        self.input.as_bytes().get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(|b| b.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, byte: u8) -> Result<(), ProtocolError> {
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(malformed(
                self.input,
                &format!("expected {:?} at offset {}", char::from(byte), self.pos),
            ))
        }
    }

    fn parse_name(&mut self) -> Result<String, ProtocolError> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.' | b':'))
        {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(malformed(self.input, "expected a name"));
        }
        Ok(self.input[start..self.pos].to_string())
    }

    fn parse_element(&mut self) -> Result<Element, ProtocolError> {
        self.expect(b'<')?;
        let name = self.parse_name()?;
        let mut attrs = Vec::new();

        loop {
            self.skip_whitespace();
            match self.peek() {
                Some(b'/') => {
                    self.pos += 1;
                    self.expect(b'>')?;
                    return Ok(Element {
                        name,
                        attrs,
                        children: Vec::new(),
                    });
                }
                Some(b'>') => {
                    self.pos += 1;
                    let children = self.parse_children(&name)?;
                    return Ok(Element {
                        name,
                        attrs,
                        children,
                    });
                }
                Some(_) => {
                    let key = self.parse_name()?;
                    self.skip_whitespace();
                    self.expect(b'=')?;
                    self.skip_whitespace();
                    let value = self.parse_quoted()?;
                    attrs.push((key, value));
                }
                None => return Err(malformed(self.input, "unterminated tag")),
            }
        }
    }

    fn parse_quoted(&mut self) -> Result<String, ProtocolError> {
        let quote = match self.peek() {
            Some(q @ (b'"' | b'\'')) => q,
            _ => return Err(malformed(self.input, "expected a quoted attribute value")),
        };
        self.pos += 1;
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b == quote {
                let raw = &self.input[start..self.pos];
                self.pos += 1;
                return self.decode_entities(raw);
            }
            self.pos += 1;
        }
        Err(malformed(self.input, "unterminated attribute value"))
    }

    fn parse_children(&mut self, parent: &str) -> Result<Vec<Node>, ProtocolError> {
        let mut children = Vec::new();
        loop {
            if self.rest().starts_with("</") {
                self.pos += 2;
                let close = self.parse_name()?;
                if close != parent {
                    return Err(malformed(
                        self.input,
                        &format!("close tag </{close}> does not match <{parent}>"),
                    ));
                }
                self.skip_whitespace();
                self.expect(b'>')?;
                return Ok(children);
            }
            match self.peek() {
                Some(b'<') => children.push(Node::Element(self.parse_element()?)),
                Some(_) => {
                    let start = self.pos;
                    while self.peek().is_some_and(|b| b != b'<') {
                        self.pos += 1;
                    }
                    let text = self.decode_entities(&self.input[start..self.pos])?;
                    children.push(Node::Text(text));
                }
                None => {
                    return Err(malformed(
                        self.input,
                        &format!("missing close tag for <{parent}>"),
                    ));
                }
            }
        }
    }

    fn decode_entities(&self, raw: &str) -> Result<String, ProtocolError> {
        if !raw.contains('&') {
            return Ok(raw.to_string());
        }
        let mut out = String::with_capacity(raw.len());
        let mut rest = raw;
        while let Some(amp) = rest.find('&') {
            out.push_str(&rest[..amp]);
            let tail = &rest[amp..];
            let Some(semi) = tail.find(';') else {
                return Err(malformed(self.input, "unterminated entity reference"));
            };
            let entity = &tail[1..semi];
            match entity {
                "amp" => out.push('&'),
                "lt" => out.push('<'),
                "gt" => out.push('>'),
                "quot" => out.push('"'),
                "apos" => out.push('\''),
                _ => {
                    let code = entity
                        .strip_prefix("#x")
                        .or_else(|| entity.strip_prefix("#X"))
                        .map(|hex| u32::from_str_radix(hex, 16))
                        .or_else(|| entity.strip_prefix('#').map(str::parse))
                        .and_then(Result::ok)
                        .and_then(char::from_u32);
                    match code {
                        Some(c) => out.push(c),
                        None => {
                            return Err(malformed(
                                self.input,
                                &format!("unknown entity &{entity};"),
                            ));
                        }
                    }
                }
            }
            rest = &tail[semi + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

/// Render an element back to markup. Only used by tests and diagnostics;
/// commands are built from fixed templates, never by tree mutation.
#[allow(dead_code)]
pub(crate) fn to_markup(el: &Element) -> String {
    let mut out = String::new();
    write_element(el, &mut out);
    out
}

#[allow(dead_code)]
fn write_element(el: &Element, out: &mut String) {
    let _ = write!(out, "<{}", el.name);
    for (key, value) in &el.attrs {
        let _ = write!(out, " {key}=\"{}\"", escape(value));
    }
    if el.children.is_empty() {
        out.push_str("/>");
        return;
    }
    out.push('>');
    for node in &el.children {
        match node {
            Node::Element(child) => write_element(child, out),
            Node::Text(text) => out.push_str(&escape(text)),
        }
    }
    let _ = write!(out, "</{}>", el.name);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_element_with_attrs() {
        let el = parse(r#"<state_id val="3"/>"#).unwrap();
        assert_eq!(el.name, "state_id");
        assert_eq!(el.attr("val"), Some("3"));
        assert!(el.children.is_empty());
    }

    #[test]
    fn test_parse_nested_children() {
        let el = parse(r#"<pair><state_id val="2"/><string>ok</string></pair>"#).unwrap();
        assert_eq!(el.child("state_id").unwrap().attr("val"), Some("2"));
        assert_eq!(el.child("string").unwrap().text(), "ok");
    }

    #[test]
    fn test_parse_single_quoted_attr() {
        let el = parse("<option val='none'/>").unwrap();
        assert_eq!(el.attr("val"), Some("none"));
    }

    #[test]
    fn test_entities_decoded_in_text_and_attrs() {
        let el = parse(r#"<m note="a &lt; b">1 &amp; 2 &gt; 0</m>"#).unwrap();
        assert_eq!(el.attr("note"), Some("a < b"));
        assert_eq!(el.text(), "1 & 2 > 0");
    }

    #[test]
    fn test_numeric_character_references() {
        let el = parse("<m>&#65;&#x42;</m>").unwrap();
        assert_eq!(el.text(), "AB");
    }

    #[test]
    fn test_unknown_entity_is_malformed() {
        assert!(parse("<m>&bogus;</m>").is_err());
    }

    #[test]
    fn test_mismatched_close_tag_is_malformed() {
        assert!(parse("<pair><unit/></list>").is_err());
    }

    #[test]
    fn test_unterminated_document_is_malformed() {
        assert!(parse("<value val=\"good\"><state_id val=\"1\"/>").is_err());
    }

    #[test]
    fn test_normalize_replaces_nbsp() {
        assert_eq!(normalize("a&nbsp;b"), "a b");
        assert!(matches!(normalize("plain"), Cow::Borrowed(_)));
    }

    #[test]
    fn test_text_flattens_descendants() {
        let el = parse("<richpp><_><pp>forall <constr.variable>n</constr.variable>, n = n</pp></_></richpp>")
            .unwrap();
        assert_eq!(el.text(), "forall n, n = n");
    }

    #[test]
    fn test_text_strips_only_edge_newlines() {
        let el = parse("<m>\n  inner\ntext \n</m>").unwrap();
        assert_eq!(el.text(), "  inner\ntext ");
    }

    #[test]
    fn test_escape_special_characters() {
        assert_eq!(
            escape(r#"<a href="x">'&'</a>"#),
            "&lt;a href=&quot;x&quot;&gt;&apos;&amp;&apos;&lt;/a&gt;"
        );
    }

    #[test]
    fn test_descendant_depth_first() {
        let el = parse("<feedback><route/><feedback_content><message><message_level val=\"notice\"/></message></feedback_content></feedback>").unwrap();
        let message = el.descendant("message").unwrap();
        assert_eq!(
            message.child("message_level").unwrap().attr("val"),
            Some("notice")
        );
    }

    #[test]
    fn test_to_markup_roundtrip() {
        let input = r#"<pair note="a&amp;b"><string>x &lt; y</string><unit/></pair>"#;
        let el = parse(input).unwrap();
        assert_eq!(parse(&to_markup(&el)).unwrap(), el);
    }
}
