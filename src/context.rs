//! Similarity threshold filter and generation context assembly.

use tracing::debug;

use crate::models::RetrievalCandidate;

const UNKNOWN_SOURCE: &str = "unknown";

/// What survives the threshold, ready for the prompt and the metadata event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssembledContext {
    /// `[Document: <name>]\n<text>` entries, in candidate order.
    pub entries: Vec<String>,
    /// Unique non-empty source files, first appearance first.
    pub sources: Vec<String>,
    /// Chunk ids of every included candidate.
    pub source_ids: Vec<i64>,
}

impl AssembledContext {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Keep candidates with `distance < threshold` and tag each with its source.
pub fn assemble(candidates: &[RetrievalCandidate], threshold: f64) -> AssembledContext {
    let mut ctx = AssembledContext::default();
    let mut dropped = 0usize;

    for c in candidates {
        if c.distance >= threshold {
            debug!(id = c.id, distance = c.distance, threshold, "candidate below similarity threshold");
            dropped += 1;
            continue;
        }

        let label = if c.source_file.is_empty() {
            UNKNOWN_SOURCE
        } else {
            c.source_file.as_str()
        };
        ctx.entries.push(format!("[Document: {}]\n{}", label, c.content));
        ctx.source_ids.push(c.id);

        if !c.source_file.is_empty() && !ctx.sources.contains(&c.source_file) {
            ctx.sources.push(c.source_file.clone());
        }
    }

    debug!(
        included = ctx.entries.len(),
        sources = ctx.sources.len(),
        dropped,
        "context assembled"
    );
    ctx
}
