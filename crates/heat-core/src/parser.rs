//! Tagged content parser
//!
//! Model output is a mix of free text and an informal markup of
//! `<name>...</name>` regions. The parser splits a (possibly still growing)
//! string into a flat [`ContentTree`] of text and tag items, recognizing only
//! the tag names the caller allows.
//!
//! The tree is deliberately shallow: a tag's content is kept verbatim. Nested
//! markup is recovered by parsing that content again with a different
//! allow-list (see [`Tag::parse_content`]).
//!
//! ```
//! use heat_core::parser::parse;
//!
//! let tree = parse("<thinking>hmm", &["thinking"]).unwrap();
//! let tag = tree.first_tag("thinking").unwrap();
//! assert_eq!(tag.content, "hmm");
//! assert!(!tag.has_closing_tag);
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

static ATTRIBUTE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([A-Za-z_:][-A-Za-z0-9_:.]*)(?:\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'=<>`]+)))?"#)
        .expect("attribute pattern is valid")
});

/// Error type for parser misuse
///
/// Malformed or partial markup is never an error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("At least one tag name must be allowed")]
    EmptyAllowList,
    #[error("Invalid tag name: {0:?}")]
    InvalidTagName(String),
}

/// A recognized tag region
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    /// Raw inner text, not parsed further
    pub content: String,
    /// False while the closing sequence has not arrived yet
    pub has_closing_tag: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    /// Byte range of the whole region (opening tag through closing tag) in the input
    pub span: Range<usize>,
}

impl Tag {
    /// Parse this tag's content with another allow-list
    ///
    /// Spans in the returned tree are relative to `self.content`.
    pub fn parse_content<I>(&self, allowed: I) -> Result<ContentTree, ParseError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        parse(&self.content, allowed)
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

/// One item of a content tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Content {
    /// Literal text outside any recognized tag
    Text { text: String, span: Range<usize> },
    Tag(Tag),
}

impl Content {
    fn text(input: &str, span: Range<usize>) -> Self {
        Content::Text {
            text: input[span.clone()].to_string(),
            span,
        }
    }

    /// Byte range of the input this item was produced from
    pub fn span(&self) -> Range<usize> {
        match self {
            Content::Text { span, .. } => span.clone(),
            Content::Tag(tag) => tag.span.clone(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Content::Text { text, .. } => Some(text),
            Content::Tag(_) => None,
        }
    }

    pub fn as_tag(&self) -> Option<&Tag> {
        match self {
            Content::Text { .. } => None,
            Content::Tag(tag) => Some(tag),
        }
    }
}

/// Ordered sequence of content items covering the whole input
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentTree {
    pub contents: Vec<Content>,
}

impl ContentTree {
    /// A tree holding `input` as a single text item
    pub fn plain(input: &str) -> Self {
        if input.is_empty() {
            return Self::default();
        }
        Self {
            contents: vec![Content::text(input, 0..input.len())],
        }
    }

    /// Parse for display, never failing
    ///
    /// Parser misuse is logged and yields an empty tree.
    pub fn parse_lossy<I>(input: &str, allowed: I) -> Self
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        match parse(input, allowed) {
            Ok(tree) => tree,
            Err(e) => {
                warn!(error = %e, "Falling back to an empty content tree");
                Self::default()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.contents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contents.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Content> {
        self.contents.iter()
    }

    /// All recognized tags, in order
    pub fn tags(&self) -> impl Iterator<Item = &Tag> {
        self.contents.iter().filter_map(Content::as_tag)
    }

    pub fn tags_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Tag> + 'a {
        self.tags().filter(move |tag| tag.name == name)
    }

    pub fn first_tag(&self, name: &str) -> Option<&Tag> {
        self.tags().find(|tag| tag.name == name)
    }

    /// Concatenation of all literal text items
    pub fn text(&self) -> String {
        self.contents.iter().filter_map(Content::as_text).collect()
    }
}

impl IntoIterator for ContentTree {
    type Item = Content;
    type IntoIter = std::vec::IntoIter<Content>;

    fn into_iter(self) -> Self::IntoIter {
        self.contents.into_iter()
    }
}

impl<'a> IntoIterator for &'a ContentTree {
    type Item = &'a Content;
    type IntoIter = std::slice::Iter<'a, Content>;

    fn into_iter(self) -> Self::IntoIter {
        self.contents.iter()
    }
}

/// Parse `input` recognizing only the `allowed` tag names
///
/// Names are compared case-sensitively. Unterminated tags are a valid
/// outcome; only an empty or malformed allow-list is an error.
pub fn parse<I>(input: &str, allowed: I) -> Result<ContentTree, ParseError>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    Ok(TagParser::new(allowed)?.parse(input))
}

/// A parser bound to a validated allow-list
#[derive(Debug, Clone)]
pub struct TagParser {
    tags: BTreeSet<String>,
}

/// A matched opening tag
struct Opening<'a> {
    name: &'a str,
    attributes: BTreeMap<String, String>,
    /// Byte offset just past the closing `>`
    end: usize,
}

impl TagParser {
    pub fn new<I>(allowed: I) -> Result<Self, ParseError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let mut tags = BTreeSet::new();
        for name in allowed {
            let name = name.as_ref();
            if !is_valid_tag_name(name) {
                return Err(ParseError::InvalidTagName(name.to_string()));
            }
            tags.insert(name.to_string());
        }
        if tags.is_empty() {
            return Err(ParseError::EmptyAllowList);
        }
        Ok(Self { tags })
    }

    /// The allow-list this parser recognizes
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.tags.iter().map(String::as_str)
    }

    pub fn parse(&self, input: &str) -> ContentTree {
        let mut contents = Vec::new();
        let mut text_start = 0;
        let mut cursor = 0;

        while let Some(offset) = input[cursor..].find('<') {
            let open = cursor + offset;
            let Some(opening) = self.match_opening(input, open) else {
                cursor = open + 1;
                continue;
            };

            if text_start < open {
                contents.push(Content::text(input, text_start..open));
            }

            let body_start = opening.end;
            let body = &input[body_start..];
            let closing = format!("</{}>", opening.name);
            let (content, has_closing_tag, end) = match body.find(&closing) {
                Some(pos) => (&body[..pos], true, body_start + pos + closing.len()),
                None => (strip_partial_closing(body, &closing), false, input.len()),
            };

            contents.push(Content::Tag(Tag {
                name: opening.name.to_string(),
                content: content.to_string(),
                has_closing_tag,
                attributes: opening.attributes,
                span: open..end,
            }));

            cursor = end;
            text_start = end;
        }

        if text_start < input.len() {
            contents.push(Content::text(input, text_start..input.len()));
        }

        ContentTree { contents }
    }

    /// Try to read an allowed opening tag starting at the `<` at `open`
    fn match_opening<'a>(&'a self, input: &str, open: usize) -> Option<Opening<'a>> {
        let rest = &input[open + 1..];
        for name in &self.tags {
            let Some(after) = rest.strip_prefix(name.as_str()) else {
                continue;
            };
            let name_end = open + 1 + name.len();
            match after.chars().next() {
                Some('>') => {
                    return Some(Opening {
                        name,
                        attributes: BTreeMap::new(),
                        end: name_end + 1,
                    });
                }
                Some(c) if c.is_whitespace() => {
                    // The opening tag is complete only once its `>` arrives
                    let stop = opening_tag_end(after)?;
                    return Some(Opening {
                        name,
                        attributes: parse_attributes(&after[..stop]),
                        end: name_end + stop + 1,
                    });
                }
                _ => continue,
            }
        }
        None
    }
}

fn is_valid_tag_name(name: &str) -> bool {
    !name.is_empty()
        && !name
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '<' | '>' | '/' | '='))
}

/// Drop a trailing fragment of the closing sequence from unterminated content
///
/// Keeps unterminated content a prefix of the content the tag will have once
/// its closing sequence has fully arrived.
fn strip_partial_closing<'a>(body: &'a str, closing: &str) -> &'a str {
    let closing = closing.as_bytes();
    for len in (1..closing.len()).rev() {
        if body.as_bytes().ends_with(&closing[..len]) {
            // The fragment starts with `<`, which is always a char boundary
            return &body[..body.len() - len];
        }
    }
    body
}

/// Offset of the `>` ending an opening tag's attribute section
///
/// Angle brackets inside quoted values belong to the value. A `<` outside
/// quotes means the candidate was never a tag.
fn opening_tag_end(raw: &str) -> Option<usize> {
    let mut quote = None;
    let mut after_equals = false;
    for (i, c) in raw.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None => match c {
                '>' => return Some(i),
                '<' => return None,
                '"' | '\'' if after_equals => quote = Some(c),
                _ => {}
            },
        }
        if !c.is_whitespace() {
            after_equals = quote.is_none() && c == '=';
        }
    }
    None
}

fn parse_attributes(raw: &str) -> BTreeMap<String, String> {
    ATTRIBUTE_RE
        .captures_iter(raw)
        .filter_map(|caps| {
            let key = caps.get(1)?.as_str().to_string();
            let value = caps
                .get(2)
                .or_else(|| caps.get(3))
                .or_else(|| caps.get(4))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();
            Some((key, value))
        })
        .collect()
}
