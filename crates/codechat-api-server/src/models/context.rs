use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

fn is_false(value: &bool) -> bool {
    !*value
}

/// A single file's content and metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileContent {
    pub path: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_base64: bool,
}

/// A node in the file tree. Directories hold children, files are leaves.
/// Children are keyed by name in a BTreeMap so iteration is deterministic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileNode {
    pub name: String,
    pub is_dir: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub children: BTreeMap<String, FileNode>,
}

impl FileNode {
    pub fn new(name: &str, is_dir: bool) -> Self {
        Self {
            name: name.to_string(),
            is_dir,
            children: BTreeMap::new(),
        }
    }

    /// Unnamed root node; renders children only.
    pub fn root() -> Self {
        Self::new("", true)
    }

    /// Insert a file path, creating intermediate directory nodes.
    pub fn add_path(&mut self, path: &str) {
        self.insert(path, false);
    }

    /// Insert a path whose final segment is itself a directory.
    pub fn add_dir(&mut self, path: &str) {
        self.insert(path, true);
    }

    fn insert(&mut self, path: &str, trailing_dir: bool) {
        let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        if parts.is_empty() {
            return;
        }

        let mut current = self;
        for (i, part) in parts.iter().enumerate() {
            let is_last = i == parts.len() - 1;
            let is_dir = !is_last || trailing_dir;
            current = current
                .children
                .entry((*part).to_string())
                .or_insert_with(|| FileNode::new(part, is_dir));
            // Intermediate segments are always directories, even when the
            // node was first seen as a leaf.
            if is_dir {
                current.is_dir = true;
            }
        }
    }

    /// Render the tree with box-drawing connectors, directories before
    /// files, alphabetical within each group.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out, "", true);
        out
    }

    fn render_into(&self, out: &mut String, prefix: &str, is_last: bool) {
        let mut child_prefix = prefix.to_string();
        if !self.name.is_empty() {
            out.push_str(prefix);
            if is_last {
                out.push_str("└── ");
                child_prefix.push_str("    ");
            } else {
                out.push_str("├── ");
                child_prefix.push_str("│   ");
            }
            out.push_str(&self.name);
            out.push('\n');
        }

        let mut children: Vec<&FileNode> = self.children.values().collect();
        children.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));

        let count = children.len();
        for (i, child) in children.into_iter().enumerate() {
            child.render_into(out, &child_prefix, i == count - 1);
        }
    }
}

/// Immutable code context built by an extraction collaborator: the file tree
/// plus the path → content map. Paths are normalized to forward slashes; the
/// map is ordered so downstream file selection is deterministic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeContext {
    pub file_tree: FileNode,
    pub file_contents: BTreeMap<String, FileContent>,
}

impl CodeContext {
    pub fn new() -> Self {
        Self {
            file_tree: FileNode::root(),
            file_contents: BTreeMap::new(),
        }
    }

    pub fn file_count(&self) -> usize {
        self.file_contents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.file_contents.is_empty()
    }

    /// Register a file in both the tree and the content map.
    pub fn insert_file(&mut self, path: &str, raw: Vec<u8>, use_base64: bool) {
        let content = if use_base64 {
            FileContent {
                path: path.to_string(),
                content: BASE64.encode(&raw),
                is_base64: true,
            }
        } else {
            FileContent {
                path: path.to_string(),
                content: String::from_utf8_lossy(&raw).into_owned(),
                is_base64: false,
            }
        };

        self.file_tree.add_path(path);
        self.file_contents.insert(path.to_string(), content);
    }
}

impl Default for CodeContext {
    fn default() -> Self {
        Self::new()
    }
}
