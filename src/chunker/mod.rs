//! Code chunking.
//!
//! Splits a Python source file into named, non-overlapping chunks — the unit
//! of mutation and oracle generation. Two modes: `ast` walks the syntax tree
//! and emits one chunk per top-level function or class definition; `llm` asks
//! the model to propose boundaries and validates every proposal against the
//! original text before trusting it.

use crate::llm::LlmClient;
use crate::parser;
use crate::prompt;
use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tree_sitter::{Node, Parser};

/// Chunking strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkerMode {
    /// Ask the model to propose chunk boundaries.
    Llm,
    /// Walk the syntax tree for top-level definitions.
    Ast,
}

impl std::fmt::Display for ChunkerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Llm => write!(f, "llm"),
            Self::Ast => write!(f, "ast"),
        }
    }
}

/// What a chunk contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    Function,
    /// A whole class, methods included. Methods are never chunked
    /// individually.
    Class,
    /// An LLM-proposed region with no syntactic classification.
    Block,
}

impl ChunkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Class => "class",
            Self::Block => "block",
        }
    }
}

/// A bounded, named region of the source file. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// Unique within a run; derives output file names.
    pub id: String,
    /// Position in declaration order.
    pub index: usize,
    pub kind: ChunkKind,
    /// Byte span into the original source. Spans of distinct chunks never
    /// overlap.
    pub start_byte: usize,
    pub end_byte: usize,
    /// 1-based line range, for reporting.
    pub start_line: usize,
    pub end_line: usize,
    /// Whether this chunk is a mutation target. Imports, constants, and
    /// dunder-only definitions are not.
    pub mutable: bool,
}

impl Chunk {
    /// The chunk's text as a slice of the original source.
    pub fn text<'a>(&self, source: &'a str) -> &'a str {
        &source[self.start_byte..self.end_byte]
    }
}

/// Chunker output: the chunks that survived validation plus warnings for the
/// ones that did not.
#[derive(Debug, Default)]
pub struct ChunkSet {
    pub chunks: Vec<Chunk>,
    pub warnings: Vec<String>,
}

/// Splice a replacement chunk into the original source, producing the full
/// mutant file. The replacement's trailing newlines are normalized so the
/// text following the span is preserved as-is.
pub fn stitch(source: &str, chunk: &Chunk, replacement: &str) -> String {
    let mut out = String::with_capacity(source.len() + replacement.len());
    out.push_str(&source[..chunk.start_byte]);
    out.push_str(replacement.trim_end_matches('\n'));
    out.push_str(&source[chunk.end_byte..]);
    out
}

/// Extract chunks by walking the Python syntax tree: one chunk per top-level
/// function or class, in declaration order. Module-level statements outside
/// any definition are not chunked.
pub fn extract_chunks_ast(source: &str) -> Result<ChunkSet> {
    let mut parser = Parser::new();
    let language = tree_sitter_python::LANGUAGE;
    parser
        .set_language(&language.into())
        .context("Failed to load Python grammar")?;

    let tree = parser
        .parse(source, None)
        .context("Failed to parse source file")?;
    let root = tree.root_node();
    if root.has_error() {
        anyhow::bail!("Source file is not valid Python");
    }

    let mut set = ChunkSet::default();
    let mut seen: HashMap<String, usize> = HashMap::new();

    for i in 0..root.child_count() {
        let Some(node) = root.child(i) else { continue };

        // A decorated definition spans its decorators; classify by the
        // definition underneath.
        let (span_node, def_node) = match node.kind() {
            "function_definition" | "class_definition" => (node, node),
            "decorated_definition" => match node.child_by_field_name("definition") {
                Some(def) => (node, def),
                None => continue,
            },
            _ => continue,
        };

        let kind = match def_node.kind() {
            "function_definition" => ChunkKind::Function,
            "class_definition" => ChunkKind::Class,
            _ => continue,
        };

        let name = def_node
            .child_by_field_name("name")
            .map(|n| node_text(n, source).to_string())
            .unwrap_or_else(|| format!("anonymous_{}", set.chunks.len()));

        let count = seen.entry(name.clone()).or_insert(0);
        let id = if *count == 0 {
            name.clone()
        } else {
            format!("{}_{}", name, *count + 1)
        };
        *count += 1;

        let mutable = match kind {
            ChunkKind::Function => !(name.starts_with("__") && name.ends_with("__")),
            ChunkKind::Class => true,
            ChunkKind::Block => false,
        };

        set.chunks.push(Chunk {
            id,
            index: set.chunks.len(),
            kind,
            start_byte: span_node.start_byte(),
            end_byte: span_node.end_byte(),
            start_line: span_node.start_position().row + 1,
            end_line: span_node.end_position().row + 1,
            mutable,
        });
    }

    tracing::debug!(
        "AST chunker extracted {} chunks ({} mutable)",
        set.chunks.len(),
        set.chunks.iter().filter(|c| c.mutable).count()
    );

    Ok(set)
}

#[derive(Debug, Deserialize)]
struct ProposedChunks {
    chunks: Vec<ProposedChunk>,
}

#[derive(Debug, Deserialize)]
struct ProposedChunk {
    chunk_id: String,
    #[serde(default)]
    is_mutable: bool,
    code: String,
}

/// Extract chunks by asking the model for boundaries, then validating that
/// every proposed chunk maps to a contiguous range of the original file in
/// file order. Proposals that fail validation are dropped with a warning,
/// not fatal to the run.
pub async fn extract_chunks_llm(client: &LlmClient, source: &str) -> Result<ChunkSet> {
    let response = client
        .complete(&prompt::propose_chunks(source))
        .await
        .context("Chunk proposal call failed")?;

    let value = parser::extract_json(&response).context("Chunk proposal response had no JSON")?;
    let proposed: ProposedChunks =
        serde_json::from_value(value).context("Chunk proposal JSON had unexpected shape")?;

    let mut set = ChunkSet::default();
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut cursor = 0usize;

    for p in proposed.chunks {
        let Some((start, end)) = locate(source, cursor, &p.code) else {
            let warning = format!(
                "chunk '{}' does not map to a contiguous range of the file in order; dropped",
                p.chunk_id
            );
            tracing::warn!("{}", warning);
            set.warnings.push(warning);
            continue;
        };
        cursor = end;

        let count = seen.entry(p.chunk_id.clone()).or_insert(0);
        let id = if *count == 0 {
            p.chunk_id.clone()
        } else {
            format!("{}_{}", p.chunk_id, *count + 1)
        };
        *count += 1;

        let (start_line, end_line) = line_span(source, start, end);

        set.chunks.push(Chunk {
            id,
            index: set.chunks.len(),
            kind: ChunkKind::Block,
            start_byte: start,
            end_byte: end,
            start_line,
            end_line,
            mutable: p.is_mutable,
        });
    }

    tracing::debug!(
        "LLM chunker kept {} chunks, dropped {}",
        set.chunks.len(),
        set.warnings.len()
    );

    Ok(set)
}

/// Find `code` as a contiguous span of `source` at or after `from`, trying
/// the exact text first and then a whitespace-trimmed version.
fn locate(source: &str, from: usize, code: &str) -> Option<(usize, usize)> {
    if code.trim().is_empty() {
        return None;
    }
    if let Some(off) = source[from..].find(code) {
        return Some((from + off, from + off + code.len()));
    }
    let trimmed = code.trim_matches('\n');
    if trimmed.is_empty() {
        return None;
    }
    source[from..]
        .find(trimmed)
        .map(|off| (from + off, from + off + trimmed.len()))
}

/// 1-based line range for a byte span. The start line is one past the number
/// of newlines before the span, so a span beginning right after a newline
/// lands on the following line.
fn line_span(source: &str, start: usize, end: usize) -> (usize, usize) {
    let start_line = source[..start].matches('\n').count() + 1;
    let end_line = source[..end].lines().count().max(start_line);
    (start_line, end_line)
}

fn node_text<'a>(node: Node<'a>, source: &'a str) -> &'a str {
    &source[node.start_byte()..node.end_byte()]
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
import os

LIMIT = 10


def clamp(x, lo, hi):
    return max(lo, min(x, hi))


def __helper__():
    return None


@decorator
def tagged(x):
    return x


class Greeter:
    def __init__(self, name):
        self.name = name

    def greet(self):
        return f\"hello {self.name}\"


if __name__ == \"__main__\":
    print(clamp(5, 0, LIMIT))
";

    // =========================================================================
    // AST mode
    // =========================================================================

    #[test]
    fn test_ast_chunks_top_level_definitions_only() {
        let set = extract_chunks_ast(SAMPLE).unwrap();
        let ids: Vec<&str> = set.chunks.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["clamp", "__helper__", "tagged", "Greeter"]);
    }

    #[test]
    fn test_ast_class_is_one_chunk() {
        let set = extract_chunks_ast(SAMPLE).unwrap();
        let greeter = set.chunks.iter().find(|c| c.id == "Greeter").unwrap();
        assert_eq!(greeter.kind, ChunkKind::Class);
        assert!(greeter.text(SAMPLE).contains("def greet"));
        // Methods do not appear as separate chunks.
        assert!(!set.chunks.iter().any(|c| c.id == "greet"));
    }

    #[test]
    fn test_ast_chunks_disjoint_and_ordered() {
        let set = extract_chunks_ast(SAMPLE).unwrap();
        for pair in set.chunks.windows(2) {
            assert!(pair[0].end_byte <= pair[1].start_byte);
        }
    }

    #[test]
    fn test_ast_dunder_function_not_mutable() {
        let set = extract_chunks_ast(SAMPLE).unwrap();
        let helper = set.chunks.iter().find(|c| c.id == "__helper__").unwrap();
        assert!(!helper.mutable);
        let clamp = set.chunks.iter().find(|c| c.id == "clamp").unwrap();
        assert!(clamp.mutable);
    }

    #[test]
    fn test_ast_decorator_included_in_span() {
        let set = extract_chunks_ast(SAMPLE).unwrap();
        let tagged = set.chunks.iter().find(|c| c.id == "tagged").unwrap();
        assert!(tagged.text(SAMPLE).starts_with("@decorator"));
        assert_eq!(tagged.kind, ChunkKind::Function);
    }

    #[test]
    fn test_ast_module_level_statements_not_chunked() {
        let set = extract_chunks_ast(SAMPLE).unwrap();
        for chunk in &set.chunks {
            let text = chunk.text(SAMPLE);
            assert!(!text.contains("import os"));
            assert!(!text.contains("__main__"));
        }
    }

    #[test]
    fn test_ast_duplicate_names_get_unique_ids() {
        let source = "def f():\n    return 1\n\ndef f():\n    return 2\n";
        let set = extract_chunks_ast(source).unwrap();
        let ids: Vec<&str> = set.chunks.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["f", "f_2"]);
    }

    #[test]
    fn test_ast_invalid_source_fails() {
        assert!(extract_chunks_ast("def broken(:\n").is_err());
    }

    #[test]
    fn test_ast_line_numbers() {
        let set = extract_chunks_ast(SAMPLE).unwrap();
        let clamp = set.chunks.iter().find(|c| c.id == "clamp").unwrap();
        assert_eq!(clamp.start_line, 6);
        assert_eq!(clamp.end_line, 7);
    }

    // =========================================================================
    // Stitching
    // =========================================================================

    #[test]
    fn test_stitch_replaces_only_target_chunk() {
        let set = extract_chunks_ast(SAMPLE).unwrap();
        let clamp = set.chunks.iter().find(|c| c.id == "clamp").unwrap();
        let mutant = "def clamp(x, lo, hi):\n    return min(lo, max(x, hi))\n";

        let stitched = stitch(SAMPLE, clamp, mutant);
        assert!(stitched.contains("min(lo, max(x, hi))"));
        assert!(!stitched.contains("max(lo, min(x, hi))"));
        // Everything else survives untouched.
        assert!(stitched.contains("import os"));
        assert!(stitched.contains("class Greeter:"));
        assert!(stitched.contains("__main__"));
    }

    #[test]
    fn test_stitch_preserves_following_whitespace() {
        let set = extract_chunks_ast(SAMPLE).unwrap();
        let clamp = set.chunks.iter().find(|c| c.id == "clamp").unwrap();
        let mutant = "def clamp(x, lo, hi):\n    return x\n\n\n\n";

        let stitched = stitch(SAMPLE, clamp, mutant);
        // The original blank-line separation after the chunk is kept exactly
        // once, regardless of the replacement's trailing newlines.
        assert!(stitched.contains("return x\n\n\ndef __helper__"));
    }

    // =========================================================================
    // LLM-proposal validation
    // =========================================================================

    #[test]
    fn test_locate_exact_and_in_order() {
        let source = "aaa\nbbb\nccc\n";
        assert_eq!(locate(source, 0, "bbb\n"), Some((4, 8)));
        // Search starts at the cursor: earlier text is not found again.
        assert_eq!(locate(source, 8, "bbb\n"), None);
    }

    #[test]
    fn test_locate_trimmed_fallback() {
        let source = "def f():\n    pass\n";
        assert!(locate(source, 0, "\ndef f():\n    pass\n\n").is_some());
    }

    #[test]
    fn test_locate_rejects_empty() {
        assert_eq!(locate("code", 0, "   \n"), None);
    }

    #[test]
    fn test_line_span_at_line_boundary() {
        // A span starting on the byte right after a newline belongs to the
        // next line, not the one the newline ended.
        assert_eq!(line_span("aaa\nbbb\nccc\n", 4, 8), (2, 2));
        assert_eq!(line_span("aaa\nbbb\nccc\n", 0, 4), (1, 1));
    }

    #[test]
    fn test_line_span_multi_line() {
        assert_eq!(line_span("aaa\nbbb\nccc\n", 0, 12), (1, 3));
        assert_eq!(line_span("aaa\nbbb\nccc", 8, 11), (3, 3));
    }
}
