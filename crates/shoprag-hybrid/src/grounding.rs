//! Turns ranked candidates into the answer generator's input.
use async_trait::async_trait;

use shoprag_core::traits::{TextIndexer, VectorIndexer};
use shoprag_core::types::{Candidate, ChunkId, Provenance};

use crate::service::{QueryRequest, RetrievalMode, RetrievalService};

pub const NO_RELEVANT_INFORMATION: &str =
    "I could not find relevant information in the manuals or notes for this machine.";

/// One numbered source as it appears in the context.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRef {
    pub number: usize,
    pub chunk_id: ChunkId,
    pub citation: String,
    pub provenance: Provenance,
}

/// Short citation line: `Manual "VF-2 Operator" p. 12, SPINDLE` or `Note N1 (2024-03-02 14:05)`.
pub fn citation(provenance: &Provenance) -> String {
    match provenance {
        Provenance::Manual { title, pages, section: Some(section), .. } => {
            format!("Manual \"{title}\" {pages}, {section}")
        }
        Provenance::Manual { title, pages, section: None, .. } => format!("Manual \"{title}\" {pages}"),
        Provenance::Note { note_id, created_at } => {
            format!("Note {note_id} ({})", created_at.format("%Y-%m-%d %H:%M"))
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroundingContext {
    pub text: String,
    pub sources: Vec<SourceRef>,
    /// Candidates left out because the character budget ran out.
    pub omitted: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct ContextBuilder {
    max_chars: usize,
}

impl ContextBuilder {
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }

    /// Numbered `[n] citation` blocks in rank order. Blocks that would push the
    /// context past `max_chars` are dropped; a first block that is too long on
    /// its own is cut at a char boundary.
    pub fn build(&self, candidates: &[Candidate]) -> GroundingContext {
        let mut text = String::new();
        let mut sources = Vec::new();
        for candidate in candidates {
            let number = sources.len() + 1;
            let cite = citation(&candidate.provenance);
            let separator = if text.is_empty() { "" } else { "\n\n" };
            let block = format!("{separator}[{number}] {cite}\n{}", candidate.text.trim());
            let remaining = self.max_chars.saturating_sub(text.chars().count());
            if block.chars().count() > remaining {
                if !sources.is_empty() {
                    break;
                }
                text.extend(block.chars().take(remaining));
            } else {
                text.push_str(&block);
            }
            sources.push(SourceRef {
                number,
                chunk_id: candidate.chunk_id,
                citation: cite,
                provenance: candidate.provenance.clone(),
            });
        }
        GroundingContext { omitted: candidates.len() - sources.len(), text, sources }
    }
}

pub fn prompt(question: &str, context: &GroundingContext) -> String {
    format!(
        "You are an experienced maintenance engineer helping a machine operator.\n\
         Answer the question using only the numbered sources below. Cite the sources \
         you use like [1]. If the sources do not contain the answer, say that you are \
         not sure instead of guessing.\n\n\
         Sources:\n{}\n\n\
         Question: {}\n\
         Answer:",
        context.text,
        question.trim()
    )
}

/// The external answer-generation call.
#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Answer {
    pub text: String,
    pub sources: Vec<SourceRef>,
    pub mode: RetrievalMode,
}

impl<TI, VI> RetrievalService<TI, VI>
where
    TI: TextIndexer + 'static,
    VI: VectorIndexer + 'static,
{
    /// Builds the grounding context for `request` without generating.
    pub async fn context(&self, request: QueryRequest) -> shoprag_core::Result<(GroundingContext, RetrievalMode)> {
        let outcome = self.query(request).await?;
        let context = ContextBuilder::new(self.settings.retrieval.max_context_chars).build(&outcome.candidates);
        Ok((context, outcome.mode))
    }

    /// Retrieves, grounds and generates. With no candidates the generator is
    /// not called and the fixed [`NO_RELEVANT_INFORMATION`] answer is returned.
    pub async fn ask(&self, generator: &dyn AnswerGenerator, request: QueryRequest) -> anyhow::Result<Answer> {
        let question = request.text.clone();
        let (context, mode) = self.context(request).await?;
        if context.sources.is_empty() {
            tracing::debug!(query = %question, "no candidates; skipping generation");
            return Ok(Answer { text: NO_RELEVANT_INFORMATION.to_string(), sources: Vec::new(), mode });
        }
        let text = generator.generate(&prompt(&question, &context)).await?;
        Ok(Answer { text: text.trim().to_string(), sources: context.sources, mode })
    }
}
