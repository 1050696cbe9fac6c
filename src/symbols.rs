// ABOUTME: Symbol provider contract and a declaration-scanning default implementation
// ABOUTME: Finds function, filter, workflow, class and configuration declarations and their references
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 dravr.ai

use async_trait::async_trait;

use crate::types::BridgeError;
use crate::workspace::{Position, ScriptFile, TextRange};

/// Kind of declared symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    /// `function Name`
    Function,
    /// `filter Name`
    Filter,
    /// `workflow Name`
    Workflow,
    /// `class Name`
    Class,
    /// `configuration Name`
    Configuration,
}

const DECLARATION_KEYWORDS: &[(&str, SymbolKind)] = &[
    ("function", SymbolKind::Function),
    ("filter", SymbolKind::Filter),
    ("workflow", SymbolKind::Workflow),
    ("class", SymbolKind::Class),
    ("configuration", SymbolKind::Configuration),
];

/// A range inside a document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolLocation {
    /// Document URI
    pub uri: String,
    /// Range of the symbol name
    pub range: TextRange,
}

/// A declared symbol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptSymbol {
    /// Declared name
    pub name: String,
    /// Declaration keyword
    pub kind: SymbolKind,
    /// Where the name appears in the declaration
    pub location: SymbolLocation,
}

/// Symbol lookups used by the language endpoint
#[async_trait]
pub trait SymbolProvider: Send + Sync {
    /// Declarations in one document
    async fn document_symbols(&self, file: &ScriptFile) -> Result<Vec<ScriptSymbol>, BridgeError>;

    /// Declaration of the symbol under `position`, searching `file` then `others`
    async fn find_definition(
        &self,
        file: &ScriptFile,
        position: Position,
        others: &[ScriptFile],
    ) -> Result<Option<SymbolLocation>, BridgeError>;

    /// Uses of the symbol under `position` across `file` and `others`
    async fn find_references(
        &self,
        file: &ScriptFile,
        position: Position,
        others: &[ScriptFile],
        include_declaration: bool,
    ) -> Result<Vec<SymbolLocation>, BridgeError>;

    /// Declarations whose name contains `query`, case-insensitively
    async fn workspace_symbols(
        &self,
        query: &str,
        files: &[ScriptFile],
    ) -> Result<Vec<ScriptSymbol>, BridgeError>;
}

// ============================================================================
// Declaration Scanner
// ============================================================================

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | ':')
}

fn utf16_len(text: &str) -> u32 {
    text.chars().map(|c| c.len_utf16() as u32).sum()
}

fn name_range(line: u32, prefix: &str, name: &str) -> TextRange {
    let start = utf16_len(prefix);
    TextRange {
        start: Position::new(line, start),
        end: Position::new(line, start + utf16_len(name)),
    }
}

/// Strip a `global:`/`script:`/`local:`/`private:` scope qualifier
fn unscoped(name: &str) -> &str {
    name.split_once(':')
        .filter(|(scope, _)| {
            ["global", "script", "local", "private"]
                .iter()
                .any(|s| s.eq_ignore_ascii_case(scope))
        })
        .map_or(name, |(_, rest)| rest)
}

fn declarations(file: &ScriptFile) -> Vec<ScriptSymbol> {
    let mut found = Vec::new();
    for (line, index) in file.contents.lines().zip(0u32..) {
        let body = line.trim_start();
        for (keyword, kind) in DECLARATION_KEYWORDS {
            let Some(head) = body.get(..keyword.len()) else {
                continue;
            };
            if !head.eq_ignore_ascii_case(keyword) {
                continue;
            }
            let rest = &body[keyword.len()..];
            let trimmed = rest.trim_start();
            if trimmed.len() == rest.len() {
                // keyword must be followed by whitespace
                continue;
            }
            let name_len = trimmed
                .char_indices()
                .find(|(_, c)| !is_name_char(*c))
                .map_or(trimmed.len(), |(i, _)| i);
            if name_len == 0 {
                continue;
            }
            let name = &trimmed[..name_len];
            let prefix = &line[..line.len() - trimmed.len()];
            found.push(ScriptSymbol {
                name: unscoped(name).to_owned(),
                kind: *kind,
                location: SymbolLocation {
                    uri: file.uri.clone(),
                    range: name_range(index, prefix, name),
                },
            });
            break;
        }
    }
    found
}

/// Byte length of the prefix of `text` equal to `name` ignoring case
fn caseless_prefix(text: &str, name: &str) -> Option<usize> {
    let mut rest = text.char_indices();
    for wanted in name.chars() {
        let (_, found) = rest.next()?;
        if !found.to_lowercase().eq(wanted.to_lowercase()) {
            return None;
        }
    }
    Some(rest.next().map_or(text.len(), |(index, _)| index))
}

fn occurrences(file: &ScriptFile, name: &str) -> Vec<SymbolLocation> {
    let mut found = Vec::new();
    if name.is_empty() {
        return found;
    }
    for (line, index) in file.contents.lines().zip(0u32..) {
        let mut from = 0;
        for (start, _) in line.char_indices() {
            if start < from {
                continue;
            }
            let Some(len) = caseless_prefix(&line[start..], name) else {
                continue;
            };
            let end = start + len;
            let before_ok = line[..start]
                .chars()
                .next_back()
                .map_or(true, |c| !is_name_char(c) || c == ':');
            let after_ok = line[end..].chars().next().map_or(true, |c| !is_name_char(c));
            if before_ok && after_ok {
                found.push(SymbolLocation {
                    uri: file.uri.clone(),
                    range: name_range(index, &line[..start], &line[start..end]),
                });
                from = end;
            }
        }
    }
    found
}

/// Symbol provider that scans declaration keywords line by line
#[derive(Debug, Default, Clone, Copy)]
pub struct DeclarationSymbols;

#[async_trait]
impl SymbolProvider for DeclarationSymbols {
    async fn document_symbols(&self, file: &ScriptFile) -> Result<Vec<ScriptSymbol>, BridgeError> {
        Ok(declarations(file))
    }

    async fn find_definition(
        &self,
        file: &ScriptFile,
        position: Position,
        others: &[ScriptFile],
    ) -> Result<Option<SymbolLocation>, BridgeError> {
        let Some(word) = file.word_at(position) else {
            return Ok(None);
        };
        let word = unscoped(word);
        Ok(std::iter::once(file)
            .chain(others.iter().filter(|o| o.uri != file.uri))
            .flat_map(declarations)
            .find(|symbol| symbol.name.eq_ignore_ascii_case(word))
            .map(|symbol| symbol.location))
    }

    async fn find_references(
        &self,
        file: &ScriptFile,
        position: Position,
        others: &[ScriptFile],
        include_declaration: bool,
    ) -> Result<Vec<SymbolLocation>, BridgeError> {
        let Some(word) = file.word_at(position) else {
            return Ok(Vec::new());
        };
        let word = unscoped(word);
        let files: Vec<&ScriptFile> = std::iter::once(file)
            .chain(others.iter().filter(|o| o.uri != file.uri))
            .collect();

        let declared: Vec<SymbolLocation> = if include_declaration {
            Vec::new()
        } else {
            files
                .iter()
                .flat_map(|f| declarations(f))
                .filter(|s| s.name.eq_ignore_ascii_case(word))
                .map(|s| s.location)
                .collect()
        };

        Ok(files
            .iter()
            .flat_map(|f| occurrences(f, word))
            .filter(|location| !declared.contains(location))
            .collect())
    }

    async fn workspace_symbols(
        &self,
        query: &str,
        files: &[ScriptFile],
    ) -> Result<Vec<ScriptSymbol>, BridgeError> {
        let query = query.to_lowercase();
        Ok(files
            .iter()
            .flat_map(declarations)
            .filter(|symbol| symbol.name.to_lowercase().contains(&query))
            .collect())
    }
}
