//! Seed tree format used to populate a sandbox on boot.
//!
//! On the wire a tree is a JSON object mapping entry names to either
//! `{"file": {"contents": "..."}}` or `{"directory": {...}}`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SeedNode {
    File { contents: String },
    Directory(SeedTree),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(transparent)]
pub struct SeedTree {
    entries: BTreeMap<String, SeedNode>,
}

/// A flattened seed entry, addressed by its slash-joined path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedItem<'a> {
    Directory(&'a str),
    File(&'a str, &'a str),
}

impl SeedTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }

    pub fn with_file(mut self, name: impl Into<String>, contents: impl Into<String>) -> Self {
        self.entries.insert(
            name.into(),
            SeedNode::File {
                contents: contents.into(),
            },
        );
        self
    }

    pub fn with_directory(mut self, name: impl Into<String>, tree: SeedTree) -> Self {
        self.entries.insert(name.into(), SeedNode::Directory(tree));
        self
    }

    pub fn get(&self, name: &str) -> Option<&SeedNode> {
        self.entries.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Depth-first walk; a directory is always yielded before its children.
    pub fn walk(&self) -> Vec<(String, SeedItem<'_>)> {
        let mut out = Vec::new();
        self.walk_into("", &mut out);
        out
    }

    fn walk_into<'a>(&'a self, prefix: &str, out: &mut Vec<(String, SeedItem<'a>)>) {
        for (name, node) in &self.entries {
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}/{name}")
            };
            match node {
                SeedNode::File { contents } => {
                    out.push((path, SeedItem::File(name, contents)));
                }
                SeedNode::Directory(tree) => {
                    out.push((path.clone(), SeedItem::Directory(name)));
                    tree.walk_into(&path, out);
                }
            }
        }
    }
}
