use crate::io::fs::read_file_to_string;
use crate::make_error;
use crate::tree::tree::{NodeId, PhyloTree};
use eyre::{Report, WrapErr};
use indexmap::IndexMap;
use std::path::Path;

pub fn read_nwk_file(nwk_file_path: impl AsRef<Path>) -> Result<PhyloTree, Report> {
  let nwk_file_path = nwk_file_path.as_ref();
  let nwk_str = read_file_to_string(nwk_file_path)?;
  read_nwk_str(&nwk_str).wrap_err_with(|| format!("When parsing Newick file {nwk_file_path:#?}"))
}

/// Parses a Newick string into the arena tree. Supports quoted labels,
/// branch lengths, and `[&key=value,...]` edge annotations. A tree whose root
/// has more than two neighbors is flagged unrooted.
pub fn read_nwk_str(nwk: &str) -> Result<PhyloTree, Report> {
  let mut parser = NwkParser::new(nwk);
  let mut tree = PhyloTree::new();

  let (root, _, _) = parser.parse_subtree(&mut tree)?;
  parser.skip_whitespace();
  if !parser.consume(';') {
    return make_error!("Expected ';' at the end of the Newick string");
  }

  tree.root = root;
  tree.leaf_num = (0..tree.nodes.len()).filter(|&id| tree.is_leaf(id)).count();
  tree.rooted = tree.nodes[root].neighbors.len() <= 2;
  Ok(tree)
}

struct NwkParser<'a> {
  bytes: &'a [u8],
  pos: usize,
}

impl<'a> NwkParser<'a> {
  fn new(nwk: &'a str) -> Self {
    Self {
      bytes: nwk.as_bytes(),
      pos: 0,
    }
  }

  fn peek(&self) -> Option<u8> {
    self.bytes.get(self.pos).copied()
  }

  fn consume(&mut self, expected: char) -> bool {
    if self.peek() == Some(expected as u8) {
      self.pos += 1;
      true
    } else {
      false
    }
  }

  fn skip_whitespace(&mut self) {
    while matches!(self.peek(), Some(b) if b.is_ascii_whitespace()) {
      self.pos += 1;
    }
  }

  /// Parses one subtree and returns `(node, edge_length, edge_attrs)` where
  /// length and attrs describe the edge leading into the node
  #[allow(clippy::type_complexity)]
  fn parse_subtree(&mut self, tree: &mut PhyloTree) -> Result<(NodeId, f64, IndexMap<String, String>), Report> {
    self.skip_whitespace();

    let node = if self.consume('(') {
      let node = tree.add_node("");
      loop {
        let (child, length, attrs) = self.parse_subtree(tree)?;
        tree.connect(node, child, length, attrs);
        self.skip_whitespace();
        if self.consume(',') {
          continue;
        }
        if self.consume(')') {
          break;
        }
        return make_error!("Expected ',' or ')' at position {} of the Newick string", self.pos);
      }
      let name = self.parse_label()?;
      tree.nodes[node].name = name;
      node
    } else {
      let name = self.parse_label()?;
      tree.add_node(name)
    };

    let mut attrs = self.parse_attrs()?;

    self.skip_whitespace();
    let length = if self.consume(':') {
      self.parse_number()?
    } else {
      0.0
    };

    for (key, value) in self.parse_attrs()? {
      attrs.insert(key, value);
    }

    Ok((node, length, attrs))
  }

  fn parse_label(&mut self) -> Result<String, Report> {
    self.skip_whitespace();

    if self.consume('\'') {
      let start = self.pos;
      while let Some(b) = self.peek() {
        if b == b'\'' {
          let label = std::str::from_utf8(&self.bytes[start..self.pos])?.to_owned();
          self.pos += 1;
          return Ok(label);
        }
        self.pos += 1;
      }
      return make_error!("Unterminated quoted label in the Newick string");
    }

    let start = self.pos;
    while let Some(b) = self.peek() {
      if matches!(b, b'(' | b')' | b',' | b':' | b';' | b'[') || b.is_ascii_whitespace() {
        break;
      }
      self.pos += 1;
    }
    Ok(std::str::from_utf8(&self.bytes[start..self.pos])?.to_owned())
  }

  /// Parses a `[&key=value,...]` annotation block if present. Plain comments
  /// without the leading '&' are skipped.
  fn parse_attrs(&mut self) -> Result<IndexMap<String, String>, Report> {
    self.skip_whitespace();
    let mut attrs = IndexMap::new();

    if !self.consume('[') {
      return Ok(attrs);
    }

    let start = self.pos;
    while let Some(b) = self.peek() {
      if b == b']' {
        break;
      }
      self.pos += 1;
    }
    if !self.consume(']') {
      return make_error!("Unterminated '[' comment in the Newick string");
    }

    let content = std::str::from_utf8(&self.bytes[start..self.pos - 1])?;
    if let Some(content) = content.strip_prefix('&') {
      for part in content.split(',') {
        match part.split_once('=') {
          Some((key, value)) => {
            attrs.insert(key.trim().to_owned(), value.trim().to_owned());
          }
          None => {
            if !part.trim().is_empty() {
              return make_error!("Invalid annotation '{part}': expected key=value");
            }
          }
        }
      }
    }

    Ok(attrs)
  }

  fn parse_number(&mut self) -> Result<f64, Report> {
    self.skip_whitespace();
    let start = self.pos;
    while let Some(b) = self.peek() {
      if matches!(b, b'0'..=b'9' | b'.' | b'-' | b'+' | b'e' | b'E') {
        self.pos += 1;
      } else {
        break;
      }
    }
    let s = std::str::from_utf8(&self.bytes[start..self.pos])?;
    s.parse::<f64>()
      .map_err(|_| eyre::eyre!("Invalid branch length '{s}' at position {start} of the Newick string"))
  }
}
