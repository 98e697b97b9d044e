//! Context and citation assembly.
//!
//! Fused results are rendered into the context block handed to the
//! generator, one entry per chunk:
//!
//! ```text
//! Source Filename: manual.pdf
//! Content: <chunk text>
//! ```
//!
//! Entries are separated by a blank line. The block never exceeds the
//! character budget: entries are taken in fused order until one would not
//! fit, and that entry and everything ranked below it are left out. Chunk
//! text is never cut. Every included entry produces exactly one
//! [`Citation`], in the same order.

use serde::Serialize;

use crate::models::{Citation, FusedResult};

const SEPARATOR: &str = "\n\n";

#[derive(Debug, Clone, Default, Serialize)]
pub struct AssembledContext {
    pub text: String,
    pub citations: Vec<Citation>,
    /// Results left out because of the budget.
    pub dropped: usize,
}

impl AssembledContext {
    pub fn is_empty(&self) -> bool {
        self.citations.is_empty()
    }
}

pub fn format_entry(filename: &str, text: &str) -> String {
    format!("Source Filename: {}\nContent: {}", filename, text)
}

/// Build the context block within `max_chars` characters.
pub fn assemble(results: &[FusedResult], max_chars: usize, snippet_chars: usize) -> AssembledContext {
    let mut context = AssembledContext::default();
    let mut used = 0usize;

    for (i, result) in results.iter().enumerate() {
        let entry = format_entry(&result.chunk.source_filename, &result.chunk.text);
        let separator = if context.citations.is_empty() { 0 } else { SEPARATOR.len() };
        let cost = separator + entry.chars().count();
        if used + cost > max_chars {
            context.dropped = results.len() - i;
            break;
        }

        if separator > 0 {
            context.text.push_str(SEPARATOR);
        }
        context.text.push_str(&entry);
        used += cost;
        context.citations.push(citation(result, snippet_chars));
    }

    context
}

fn citation(result: &FusedResult, snippet_chars: usize) -> Citation {
    let chunk = &result.chunk;
    Citation {
        source_filename: chunk.source_filename.clone(),
        source_id: chunk.source_id.clone(),
        chunk_id: chunk.chunk_id.clone(),
        snippet: chunk.text.chars().take(snippet_chars).collect(),
        score: result.fused_score,
        char_offset: chunk.char_offset,
        source_url: result.source_url.clone(),
    }
}
