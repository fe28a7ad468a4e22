//! Address book persistence.
//!
//! The whole node index is written as one JSON document. Writes are
//! atomic: write to a temp file, sync, then rename over the target.

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use parking_lot::Mutex;

use super::node::Node;

/// Durable storage for the node index.
pub trait NodeStore: Send + 'static {
    /// Load the previously saved index. A store that was never written
    /// yields an empty index.
    fn load(&self) -> Result<Vec<Node>>;

    /// Replace the saved index with `nodes`.
    fn save(&self, nodes: &[Node]) -> Result<()>;
}

/// JSON file on the local filesystem.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl NodeStore for JsonFileStore {
    fn load(&self) -> Result<Vec<Node>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let text = fs::read(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        serde_json::from_slice(&text)
            .with_context(|| format!("failed to parse {}", self.path.display()))
    }

    fn save(&self, nodes: &[Node]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let data = serde_json::to_vec(nodes).context("failed to serialize node index")?;

        let tmp_path = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp_path)
                .with_context(|| format!("failed to create temp file: {}", tmp_path.display()))?;
            file.write_all(&data).context("failed to write node index")?;
            file.sync_all().context("failed to sync node index to disk")?;
        }

        fs::rename(&tmp_path, &self.path).with_context(|| {
            format!(
                "failed to rename {} to {}",
                tmp_path.display(),
                self.path.display()
            )
        })?;

        tracing::trace!(path = %self.path.display(), nodes = nodes.len(), "node index saved");
        Ok(())
    }
}

/// In-memory store. Clones share the same contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    nodes: std::sync::Arc<Mutex<Vec<Node>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_nodes(nodes: Vec<Node>) -> Self {
        Self {
            nodes: std::sync::Arc::new(Mutex::new(nodes)),
        }
    }

    /// What was last saved.
    pub fn contents(&self) -> Vec<Node> {
        self.nodes.lock().clone()
    }
}

impl NodeStore for MemoryStore {
    fn load(&self) -> Result<Vec<Node>> {
        Ok(self.nodes.lock().clone())
    }

    fn save(&self, nodes: &[Node]) -> Result<()> {
        *self.nodes.lock() = nodes.to_vec();
        Ok(())
    }
}
