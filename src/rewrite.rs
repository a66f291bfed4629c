//! HTML text rewriting
//!
//! Every run of letters whose length in code points equals the configured word
//! length gets a trademark sign (U+2122) appended. Only text nodes below
//! `<body>` are touched; elements, attributes and comments are serialized back
//! as parsed.

use crate::errors::{Error, Result};
use scraper::{ElementRef, Html, Node};

/// Word length rewritten by default.
pub const DEFAULT_WORD_LEN: usize = 6;
/// Appended after every matching word.
pub const TRADEMARK: char = '\u{2122}';

/// What part of the rewritten document is serialized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RenderScope {
  /// The whole document, `<head>` included.
  #[default]
  Document,
  /// Only the inner HTML of `<body>`.
  Body,
}

/// Rewrites HTML bodies.
#[derive(Debug, Clone, Copy)]
pub struct ContentTransformer {
  word_len: usize,
  scope: RenderScope,
}

impl Default for ContentTransformer {
  fn default() -> Self {
    ContentTransformer::new(DEFAULT_WORD_LEN)
  }
}

impl ContentTransformer {
  /// Mark words of exactly `word_len` letters.
  pub fn new(word_len: usize) -> Self {
    ContentTransformer {
      word_len,
      scope: RenderScope::default(),
    }
  }

  /// Choose how much of the document [`ContentTransformer::rewrite`] returns.
  pub fn scope(mut self, scope: RenderScope) -> Self {
    self.scope = scope;
    self
  }

  /// The configured word length.
  pub fn word_len(&self) -> usize {
    self.word_len
  }

  /// Parse `input` as HTML, rewrite the text under `<body>` and serialize it again.
  ///
  /// Fails when the input is not UTF-8 or no `<body>` element can be found; the
  /// caller is expected to fall back to the original bytes.
  pub fn rewrite(&self, input: &[u8]) -> Result<Vec<u8>> {
    let text = std::str::from_utf8(input)
      .map_err(|e| Error::html_error(format!("body is not valid utf-8: {}", e)))?;
    let mut document = Html::parse_document(text);
    let body_id = document
      .root_element()
      .children()
      .filter_map(ElementRef::wrap)
      .find(|element| element.value().name() == "body")
      .map(|body| body.id())
      .ok_or_else(|| Error::html_error("document has no body element"))?;

    let text_nodes: Vec<_> = document
      .tree
      .get(body_id)
      .map(|body| {
        body
          .descendants()
          .filter(|node| node.value().is_text())
          .map(|node| node.id())
          .collect()
      })
      .unwrap_or_default();
    for id in text_nodes {
      if let Some(mut node) = document.tree.get_mut(id) {
        if let Node::Text(text) = node.value() {
          let rebuilt = rewrite_text(&text.text, self.word_len);
          text.text = rebuilt.as_str().into();
        }
      }
    }

    let html = match self.scope {
      RenderScope::Document => document.html(),
      RenderScope::Body => document
        .tree
        .get(body_id)
        .and_then(ElementRef::wrap)
        .map(|body| body.inner_html())
        .unwrap_or_default(),
    };
    Ok(html.into_bytes())
  }
}

/// Append [`TRADEMARK`] to every word of exactly `word_len` letters in `text`.
///
/// A word is a maximal run of alphabetic code points; everything else is copied
/// through unchanged. A word already followed by the sign is left alone, so the
/// rewrite can be applied to its own output.
pub fn rewrite_text(text: &str, word_len: usize) -> String {
  let mut rebuilt = String::with_capacity(text.len());
  let mut letters = 0usize;
  let mut chars = text.chars().peekable();
  while let Some(c) = chars.next() {
    rebuilt.push(c);
    if !c.is_alphabetic() {
      letters = 0;
      continue;
    }
    letters += 1;
    match chars.peek() {
      Some(next) if next.is_alphabetic() => {}
      Some(&TRADEMARK) => letters = 0,
      _ => {
        if letters == word_len {
          rebuilt.push(TRADEMARK);
        }
        letters = 0;
      }
    }
  }
  rebuilt
}

#[cfg(test)]
mod tests {
  use super::*;

  const SAMPLE: &str = "<html><body><div>aaa aaaa aaaaa a aaa aa</div><div>b bb bbb bbbb</div><div>!  c ! ccc!</div></body></html>";

  fn body(word_len: usize, input: &str) -> String {
    let out = ContentTransformer::new(word_len)
      .scope(RenderScope::Body)
      .rewrite(input.as_bytes())
      .unwrap();
    String::from_utf8(out).unwrap()
  }

  #[test]
  fn test_rewrite_text_marks_exact_length() {
    assert_eq!(rewrite_text("aaa aaaa aa", 3), "aaa™ aaaa aa");
    assert_eq!(rewrite_text("!ccc!", 3), "!ccc™!");
    assert_eq!(rewrite_text("abc123def", 3), "abc™123def™");
    assert_eq!(rewrite_text("привет мир", 6), "привет™ мир");
    assert_eq!(rewrite_text("", 3), "");
    assert_eq!(rewrite_text("  ", 0), "  ");
    assert_eq!(rewrite_text("aaa™ bbb", 3), "aaa™ bbb™");
  }

  #[test]
  fn test_rewrite_body_scope() {
    assert_eq!(
      body(3, SAMPLE),
      "<div>aaa™ aaaa aaaaa a aaa™ aa</div><div>b bb bbb™ bbbb</div><div>!  c ! ccc™!</div>"
    );
  }

  #[test]
  fn test_rewrite_document_scope_leaves_head() {
    let input = "<html><head><title>abcdef</title></head><body><p>abcdef ghi</p></body></html>";
    let out = ContentTransformer::new(6).rewrite(input.as_bytes()).unwrap();
    assert_eq!(
      String::from_utf8(out).unwrap(),
      "<html><head><title>abcdef</title></head><body><p>abcdef™ ghi</p></body></html>"
    );
  }

  #[test]
  fn test_rewrite_keeps_attributes_and_comments() {
    assert_eq!(
      body(5, r#"<p title="hello world">hello world<!-- hello world --></p>"#),
      r#"<p title="hello world">hello™ world™<!-- hello world --></p>"#
    );
  }

  #[test]
  fn test_rewrite_is_idempotent() {
    let transformer = ContentTransformer::new(3);
    let once = transformer.rewrite(SAMPLE.as_bytes()).unwrap();
    let twice = transformer.rewrite(&once).unwrap();
    assert_eq!(once, twice);
  }

  #[test]
  fn test_rewrite_rejects_invalid_utf8() {
    assert!(ContentTransformer::default()
      .rewrite(&[0x3c, 0xff, 0xfe])
      .is_err());
  }

  #[test]
  fn test_rewrite_fragment_gets_body() {
    assert_eq!(body(6, "plain letter"), "plain letter™");
  }
}
