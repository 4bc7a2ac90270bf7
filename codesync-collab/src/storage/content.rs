//! File content service: the plain-text view of a file that the rest of
//! the application (file tree, downloads, execution) reads.
//!
//! Calls are blocking; the relay runs them on the blocking pool.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::protocol::ChannelKey;

use super::StoreError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContent {
    pub content: String,
    pub language: Option<String>,
}

impl FileContent {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            language: None,
        }
    }

    /// Content with the language guessed from the file name.
    pub fn for_file(file: &str, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            language: language_for(file).map(str::to_string),
        }
    }
}

/// Editor language id for a file name, by extension.
pub fn language_for(file: &str) -> Option<&'static str> {
    let ext = Path::new(file).extension()?.to_str()?;
    let lang = match ext.to_ascii_lowercase().as_str() {
        "rs" => "rust",
        "ts" | "tsx" => "typescript",
        "js" | "jsx" | "mjs" => "javascript",
        "py" => "python",
        "go" => "go",
        "java" => "java",
        "c" | "h" => "c",
        "cc" | "cpp" | "hpp" => "cpp",
        "json" => "json",
        "md" => "markdown",
        "html" => "html",
        "css" => "css",
        "toml" => "toml",
        "yml" | "yaml" => "yaml",
        _ => return None,
    };
    Some(lang)
}

pub trait FileContentService: Send + Sync {
    fn get_file_content(&self, key: &ChannelKey) -> Result<Option<FileContent>, StoreError>;

    fn save_file_content(&self, key: &ChannelKey, content: &FileContent) -> Result<(), StoreError>;
}

// ───────────────────────────────────────────────────────────────────
// Memory
// ───────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryContentStore {
    files: Mutex<HashMap<ChannelKey, FileContent>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: ChannelKey, content: FileContent) {
        self.files
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, content);
    }
}

impl FileContentService for MemoryContentStore {
    fn get_file_content(&self, key: &ChannelKey) -> Result<Option<FileContent>, StoreError> {
        Ok(self
            .files
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned())
    }

    fn save_file_content(&self, key: &ChannelKey, content: &FileContent) -> Result<(), StoreError> {
        self.insert(key.clone(), content.clone());
        Ok(())
    }
}

// ───────────────────────────────────────────────────────────────────
// JSON files
// ───────────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct StoredFile {
    key: ChannelKey,
    #[serde(flatten)]
    content: FileContent,
}

/// One JSON file per channel under `root`, named by the channel's
/// document id so user-supplied names never become paths.
#[derive(Debug, Clone)]
pub struct FsContentStore {
    root: PathBuf,
}

impl FsContentStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &ChannelKey) -> PathBuf {
        self.root.join(format!("{}.json", key.doc_id()))
    }
}

impl FileContentService for FsContentStore {
    fn get_file_content(&self, key: &ChannelKey) -> Result<Option<FileContent>, StoreError> {
        let path = self.path_for(key);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let stored: StoredFile = serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(Some(stored.content))
    }

    fn save_file_content(&self, key: &ChannelKey, content: &FileContent) -> Result<(), StoreError> {
        let stored = StoredFile {
            key: key.clone(),
            content: content.clone(),
        };
        let json = serde_json::to_vec_pretty(&stored)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;

        // Write-then-rename so readers never see a torn file.
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        log::debug!("saved {} ({} bytes) to {}", key, content.content.len(), path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(file: &str) -> ChannelKey {
        ChannelKey::new("room", file).unwrap()
    }

    #[test]
    fn test_language_for() {
        assert_eq!(language_for("main.rs"), Some("rust"));
        assert_eq!(language_for("App.TSX"), Some("typescript"));
        assert_eq!(language_for("Makefile"), None);
        assert_eq!(FileContent::for_file("a.py", "").language.as_deref(), Some("python"));
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryContentStore::new();
        assert_eq!(store.get_file_content(&key("a.rs")).unwrap(), None);
        store.save_file_content(&key("a.rs"), &FileContent::new("fn a() {}")).unwrap();
        assert_eq!(
            store.get_file_content(&key("a.rs")).unwrap().unwrap().content,
            "fn a() {}"
        );
    }

    #[test]
    fn test_fs_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsContentStore::open(dir.path()).unwrap();

        assert_eq!(store.get_file_content(&key("main.rs")).unwrap(), None);

        let content = FileContent::for_file("main.rs", "fn main() {}\n");
        store.save_file_content(&key("main.rs"), &content).unwrap();
        assert_eq!(store.get_file_content(&key("main.rs")).unwrap(), Some(content));

        // Reopening sees the same data.
        let reopened = FsContentStore::open(dir.path()).unwrap();
        assert!(reopened.get_file_content(&key("main.rs")).unwrap().is_some());
        assert_eq!(reopened.get_file_content(&key("other.rs")).unwrap(), None);
    }

    #[test]
    fn test_fs_store_path_is_not_user_controlled() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsContentStore::open(dir.path()).unwrap();
        let sneaky = ChannelKey::new("..", "..").unwrap();
        store.save_file_content(&sneaky, &FileContent::new("x")).unwrap();
        assert!(store.path_for(&sneaky).starts_with(dir.path()));
    }

    #[test]
    fn test_fs_store_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsContentStore::open(dir.path()).unwrap();
        std::fs::write(store.path_for(&key("bad.rs")), b"{not json").unwrap();
        assert!(matches!(
            store.get_file_content(&key("bad.rs")),
            Err(StoreError::DeserializationError(_))
        ));
    }
}
