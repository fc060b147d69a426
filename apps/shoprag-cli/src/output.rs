use std::fmt::Write;

use shoprag_hybrid::grounding::{prompt, GroundingContext};
use shoprag_hybrid::{QueryOutcome, RetrievalMode, ServiceStats};

const PREVIEW_CHARS: usize = 240;

fn preview(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= PREVIEW_CHARS {
        flat
    } else {
        let cut: String = flat.chars().take(PREVIEW_CHARS).collect();
        format!("{cut}...")
    }
}

fn mode_note(mode: RetrievalMode) -> &'static str {
    match mode {
        RetrievalMode::Hybrid => "",
        RetrievalMode::LexicalOnly => " (lexical only: vector search unavailable)",
    }
}

pub fn format_candidates(query: &str, outcome: &QueryOutcome) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Found {} results for \"{query}\"{}", outcome.candidates.len(), mode_note(outcome.mode));
    for c in &outcome.candidates {
        let machine = c.machine.as_ref().map_or("all machines", |m| m.as_str());
        let _ = writeln!(
            out,
            "\n{}. score={:.4} (vector {:.3}, lexical {:.3})  [{machine}]",
            c.rank, c.fused_score, c.vector_score, c.lexical_score
        );
        let _ = writeln!(out, "   {}", c.provenance);
        let _ = writeln!(out, "   {}", preview(&c.text));
    }
    out
}

pub fn format_context(query: &str, context: &GroundingContext, mode: RetrievalMode) -> String {
    if context.sources.is_empty() {
        return format!("No relevant passages for \"{query}\"{}", mode_note(mode));
    }
    let mut out = prompt(query, context);
    if context.omitted > 0 {
        let _ = write!(out, "\n\n({} lower-ranked passages omitted)", context.omitted);
    }
    out
}

pub fn format_stats(stats: &ServiceStats) -> String {
    format!(
        "manuals: {}\nnotes: {}\nchunks: {}\nvector entries: {}\nlexical entries: {}",
        stats.manuals, stats.notes, stats.chunks, stats.vector_entries, stats.lexical_entries
    )
}
