// ABOUTME: Open-document store with full and incremental edits and URI to path resolution
// ABOUTME: Unopened files are read from disk on demand
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 dravr.ai

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use tracing::{debug, trace};
use url::Url;

use crate::types::BridgeError;

/// File extensions treated as scripts
const SCRIPT_EXTENSIONS: &[&str] = &["ps1", "psm1", "psd1"];

/// Script extensions that can carry line breakpoints
const EXECUTABLE_EXTENSIONS: &[&str] = &["ps1", "psm1"];

/// Upper bound on unopened scripts read for workspace-wide lookups
pub const MAX_WORKSPACE_SCRIPTS: usize = 500;

fn has_extension(path: &Path, allowed: &[&str]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| allowed.iter().any(|a| a.eq_ignore_ascii_case(ext)))
}

/// Whether a path names a script, module, or manifest
pub fn is_script_path(path: &Path) -> bool {
    has_extension(path, SCRIPT_EXTENSIONS)
}

/// Whether a path names a script that can run under the debugger
pub fn is_executable_script(path: &Path) -> bool {
    has_extension(path, EXECUTABLE_EXTENSIONS)
}

// ============================================================================
// Text Model
// ============================================================================

/// Zero-based position; `character` counts UTF-16 code units
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Position {
    /// Zero-based line
    pub line: u32,
    /// Zero-based UTF-16 offset within the line
    pub character: u32,
}

impl Position {
    /// Create a position
    pub const fn new(line: u32, character: u32) -> Self {
        Self { line, character }
    }
}

/// Half-open text range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TextRange {
    /// Inclusive start
    pub start: Position,
    /// Exclusive end
    pub end: Position,
}

/// One edit; no range means the whole document is replaced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChange {
    /// Replaced range
    pub range: Option<TextRange>,
    /// Replacement text
    pub text: String,
}

/// A document as seen by analysis and symbol providers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptFile {
    /// Document URI as sent by the client
    pub uri: String,
    /// Local path when the URI names a file
    pub path: Option<PathBuf>,
    /// Client version; zero for files read from disk
    pub version: i32,
    /// Full text
    pub contents: String,
}

impl ScriptFile {
    /// Whether this document is a script
    pub fn is_script(&self) -> bool {
        self.path.as_deref().is_some_and(is_script_path)
    }

    /// Line `index`, without its terminator
    pub fn line(&self, index: u32) -> Option<&str> {
        self.contents
            .lines()
            .nth(index as usize)
            .map(|l| l.trim_end_matches('\r'))
    }

    /// Byte offset of a position
    pub fn offset_of(&self, position: Position) -> Option<usize> {
        position_to_offset(&self.contents, position)
    }

    /// Word (identifier characters plus `-` and `$`) surrounding a position
    pub fn word_at(&self, position: Position) -> Option<&str> {
        let line = self.line(position.line)?;
        let column = utf16_to_byte(line, position.character)?;
        let is_word = |c: char| c.is_alphanumeric() || c == '_' || c == '-' || c == '$';
        let start = line[..column]
            .char_indices()
            .rev()
            .take_while(|(_, c)| is_word(*c))
            .last()
            .map_or(column, |(i, _)| i);
        let end = line[column..]
            .char_indices()
            .find(|(_, c)| !is_word(*c))
            .map_or(line.len(), |(i, _)| column + i);
        (start < end).then(|| &line[start..end])
    }
}

fn utf16_to_byte(line: &str, character: u32) -> Option<usize> {
    let mut units: u32 = 0;
    for (idx, ch) in line.char_indices() {
        if units == character {
            return Some(idx);
        }
        units = units.saturating_add(ch.len_utf16() as u32);
        if units > character {
            return None;
        }
    }
    (units == character).then_some(line.len())
}

fn line_start(text: &str, line: u32) -> Option<usize> {
    if line == 0 {
        return Some(0);
    }
    text.match_indices('\n')
        .nth(line as usize - 1)
        .map(|(idx, _)| idx + 1)
}

/// Byte offset of a UTF-16 position, or `None` when it lies outside the text
pub fn position_to_offset(text: &str, position: Position) -> Option<usize> {
    let start = line_start(text, position.line)?;
    let end = text[start..].find('\n').map_or(text.len(), |i| start + i);
    utf16_to_byte(&text[start..end], position.character).map(|col| start + col)
}

/// Apply edits in order, failing on any range outside the current text
pub fn apply_changes(text: &str, changes: &[TextChange]) -> Result<String, BridgeError> {
    let mut updated = text.to_owned();
    for change in changes {
        match change.range {
            Some(range) => {
                let start = position_to_offset(&updated, range.start);
                let end = position_to_offset(&updated, range.end);
                match (start, end) {
                    (Some(start), Some(end)) if start <= end => {
                        updated.replace_range(start..end, &change.text);
                    }
                    _ => {
                        return Err(BridgeError::collaborator(
                            "workspace",
                            format!("Edit range {range:?} is outside the document"),
                        ));
                    }
                }
            }
            None => change.text.clone_into(&mut updated),
        }
    }
    Ok(updated)
}

// ============================================================================
// Workspace Trait
// ============================================================================

/// Document store consulted by the language endpoint
pub trait Workspace: Send + Sync {
    /// Track a newly opened document
    fn open(&self, uri: &str, version: i32, contents: String) -> ScriptFile;

    /// Apply edits to an open document
    fn change(&self, uri: &str, version: i32, changes: &[TextChange]) -> Result<ScriptFile, BridgeError>;

    /// Stop tracking a document; returns false when it was not open
    fn close(&self, uri: &str) -> bool;

    /// Open document, or the file read from disk
    fn get_file(&self, uri: &str) -> Result<ScriptFile, BridgeError>;

    /// Local path of a URI
    fn resolve_path(&self, uri: &str) -> Option<PathBuf>;

    /// Whether a URI names a script
    fn is_script(&self, uri: &str) -> bool {
        self.resolve_path(uri).as_deref().is_some_and(is_script_path)
    }

    /// All open documents
    fn open_files(&self) -> Vec<ScriptFile>;

    /// Open documents plus unopened scripts under the workspace root
    fn workspace_files(&self) -> Vec<ScriptFile> {
        self.open_files()
    }
}

/// Workspace backed by a map of open documents
#[derive(Debug, Default)]
pub struct InMemoryWorkspace {
    files: RwLock<HashMap<String, ScriptFile>>,
    root: Option<PathBuf>,
}

impl InMemoryWorkspace {
    /// Workspace whose relative paths resolve under `root`
    pub fn with_root(root: PathBuf) -> Self {
        Self {
            files: RwLock::default(),
            root: Some(root),
        }
    }

    /// Workspace root, if known
    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// Script files under the root, for workspace-wide symbol search
    pub fn script_files_on_disk(&self, limit: usize) -> Vec<PathBuf> {
        let Some(root) = &self.root else {
            return Vec::new();
        };
        let mut found = Vec::new();
        let mut pending = vec![root.clone()];
        while let Some(dir) = pending.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    let hidden = path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with('.'));
                    if !hidden {
                        pending.push(path);
                    }
                } else if is_script_path(&path) {
                    found.push(path);
                    if found.len() >= limit {
                        return found;
                    }
                }
            }
        }
        found
    }
}

impl Workspace for InMemoryWorkspace {
    fn open(&self, uri: &str, version: i32, contents: String) -> ScriptFile {
        let file = ScriptFile {
            uri: uri.to_owned(),
            path: self.resolve_path(uri),
            version,
            contents,
        };
        debug!(uri, version, "Document opened");
        self.files
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(uri.to_owned(), file.clone());
        file
    }

    fn change(&self, uri: &str, version: i32, changes: &[TextChange]) -> Result<ScriptFile, BridgeError> {
        let mut files = self.files.write().unwrap_or_else(PoisonError::into_inner);
        let file = files
            .get_mut(uri)
            .ok_or_else(|| BridgeError::not_found(format!("open document {uri}")))?;
        file.contents = apply_changes(&file.contents, changes)?;
        file.version = version;
        trace!(uri, version, changes = changes.len(), "Document changed");
        Ok(file.clone())
    }

    fn close(&self, uri: &str) -> bool {
        let removed = self
            .files
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(uri)
            .is_some();
        debug!(uri, removed, "Document closed");
        removed
    }

    fn get_file(&self, uri: &str) -> Result<ScriptFile, BridgeError> {
        if let Some(file) = self
            .files
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(uri)
        {
            return Ok(file.clone());
        }
        let path = self
            .resolve_path(uri)
            .ok_or_else(|| BridgeError::not_found(format!("document {uri}")))?;
        let contents = std::fs::read_to_string(&path)
            .map_err(|e| BridgeError::not_found(format!("{}: {e}", path.display())))?;
        Ok(ScriptFile {
            uri: uri.to_owned(),
            path: Some(path),
            version: 0,
            contents,
        })
    }

    fn resolve_path(&self, uri: &str) -> Option<PathBuf> {
        if let Ok(url) = Url::parse(uri) {
            return if url.scheme() == "file" {
                url.to_file_path().ok()
            } else {
                None
            };
        }
        let path = Path::new(uri);
        if path.is_absolute() {
            Some(path.to_path_buf())
        } else {
            self.root.as_ref().map(|root| root.join(path))
        }
    }

    fn open_files(&self) -> Vec<ScriptFile> {
        self.files
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn workspace_files(&self) -> Vec<ScriptFile> {
        let mut files = self.open_files();
        let open: Vec<PathBuf> = files.iter().filter_map(|f| f.path.clone()).collect();
        for path in self.script_files_on_disk(MAX_WORKSPACE_SCRIPTS) {
            if open.contains(&path) {
                continue;
            }
            let Ok(contents) = std::fs::read_to_string(&path) else {
                trace!(path = %path.display(), "Skipping unreadable script");
                continue;
            };
            let uri = Url::from_file_path(&path)
                .map_or_else(|()| path.display().to_string(), |url| url.to_string());
            files.push(ScriptFile {
                uri,
                path: Some(path),
                version: 0,
                contents,
            });
        }
        files
    }
}
