use std::collections::HashMap;

use lsp_types::{DocumentSymbol, Position, Range, Url};
use parking_lot::RwLock;

/// The original text match, promoted to a workspace-symbol shape.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkspaceSymbol {
    pub name: String,
    pub uri: Url,
    pub range: Range,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DefinitionSymbol {
    pub uri: Url,
    pub symbol: DocumentSymbol,
}

/// One populated entry: a matched reference plus the definition symbols it
/// resolves to.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkspaceSymbolDefinitionsPair {
    pub symbol: WorkspaceSymbol,
    pub definitions: Vec<DefinitionSymbol>,
}

/// Per-provider symbol store with two projections of each file: the raw
/// document-symbol tree and the flattened reference/definition pairs. The
/// two maps are guarded independently so readers of one never contend with
/// writers of the other.
#[derive(Default)]
pub struct SymbolCache {
    document_symbols: RwLock<HashMap<Url, Vec<DocumentSymbol>>>,
    workspace_symbols: RwLock<HashMap<Url, Vec<WorkspaceSymbolDefinitionsPair>>>,
}

impl SymbolCache {
    pub fn document_symbols(&self, uri: &Url) -> Option<Vec<DocumentSymbol>> {
        self.document_symbols.read().get(uri).cloned()
    }

    pub fn set_document_symbols(&self, uri: Url, symbols: Vec<DocumentSymbol>) {
        self.document_symbols.write().insert(uri, symbols);
    }

    pub fn workspace_symbols(&self, uri: &Url) -> Option<Vec<WorkspaceSymbolDefinitionsPair>> {
        self.workspace_symbols.read().get(uri).cloned()
    }

    pub fn set_workspace_symbols(&self, uri: Url, pairs: Vec<WorkspaceSymbolDefinitionsPair>) {
        self.workspace_symbols.write().insert(uri, pairs);
    }

    pub fn workspace_symbol_uris(&self) -> Vec<Url> {
        self.workspace_symbols.read().keys().cloned().collect()
    }

    pub fn invalidate(&self, uri: &Url) {
        self.document_symbols.write().remove(uri);
        self.workspace_symbols.write().remove(uri);
    }

    pub fn invalidate_all(&self) {
        self.document_symbols.write().clear();
        self.workspace_symbols.write().clear();
    }
}

/// Range length as `(lines << 32) | characters`, saturating each delta at
/// zero so malformed ranges sort first rather than wrapping.
pub fn range_length_key(range: &Range) -> u64 {
    let lines = range.end.line.saturating_sub(range.start.line) as u64;
    let characters = range.end.character.saturating_sub(range.start.character) as u64;
    (lines << 32) | characters
}

pub fn range_contains(range: &Range, position: Position) -> bool {
    position_at_or_after(position, range.start) && position_at_or_after(range.end, position)
}

fn position_at_or_after(a: Position, b: Position) -> bool {
    (a.line, a.character) >= (b.line, b.character)
}

/// Pick the enclosing symbol for a position: the smallest containing range
/// wins, ties broken by document order. Nested children are considered
/// before their parents so the innermost scope is preferred.
pub fn smallest_enclosing(symbols: &[DocumentSymbol], position: Position) -> Option<DocumentSymbol> {
    let mut best: Option<(u64, DocumentSymbol)> = None;
    collect_enclosing(symbols, position, &mut best);
    best.map(|(_, symbol)| symbol)
}

fn collect_enclosing(
    symbols: &[DocumentSymbol],
    position: Position,
    best: &mut Option<(u64, DocumentSymbol)>,
) {
    for symbol in symbols {
        if !range_contains(&symbol.range, position) {
            continue;
        }
        let key = range_length_key(&symbol.range);
        // strictly-smaller: the first symbol in document order keeps ties
        let better = best
            .as_ref()
            .map(|(best_key, _)| key < *best_key)
            .unwrap_or(true);
        if better {
            *best = Some((key, symbol.clone()));
        }
        if let Some(children) = &symbol.children {
            collect_enclosing(children, position, best);
        }
    }
}
