//! Domain types used by the indices, the ingestion pipeline and the service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Chunk identity. Assigned from a monotonically increasing counter, so a
/// later ingestion always produces larger ids than an earlier one.
pub type ChunkId = u64;

/// Stable document identity.
///
/// Manuals derive their id from `(kind, title, machine)` unless the caller
/// supplies one; notes use `note-{note_id}`. Re-ingesting under the same id
/// replaces the previous chunks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn for_manual(kind: SourceKind, title: &str, machine: Option<&MachineTag>) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(kind.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(title.trim().as_bytes());
        hasher.update(b"|");
        hasher.update(machine.map_or("", MachineTag::as_str).as_bytes());
        let hex = hasher.finalize().to_hex();
        Self(format!("manual-{}", &hex.as_str()[..16]))
    }

    pub fn for_note(note_id: &str) -> Self {
        Self(format!("note-{}", note_id.trim()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies one piece of equipment, e.g. `haas-vf2`.
///
/// Tags are normalized: trimmed, lower-cased, inner whitespace collapsed to `-`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MachineTag(String);

impl MachineTag {
    /// Returns `None` for blank input.
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw
            .split_whitespace()
            .map(str::to_lowercase)
            .collect::<Vec<_>>()
            .join("-");
        if normalized.is_empty() { None } else { Some(Self(normalized)) }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MachineTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for MachineTag {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| "machine tag must not be blank".to_string())
    }
}

impl From<MachineTag> for String {
    fn from(tag: MachineTag) -> Self {
        tag.0
    }
}

/// Query-time machine scoping.
///
/// `Machine(m)` admits chunks tagged `m` and untagged (global) chunks, never
/// chunks tagged for another machine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum MachineFilter {
    #[default]
    All,
    Machine(MachineTag),
}

impl MachineFilter {
    pub fn admits(&self, tag: Option<&MachineTag>) -> bool {
        match (self, tag) {
            (Self::All, _) | (Self::Machine(_), None) => true,
            (Self::Machine(wanted), Some(tag)) => wanted == tag,
        }
    }
}

impl From<Option<MachineTag>> for MachineFilter {
    fn from(tag: Option<MachineTag>) -> Self {
        tag.map_or(Self::All, Self::Machine)
    }
}

impl fmt::Display for MachineFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("*"),
            Self::Machine(tag) => write!(f, "{tag}"),
        }
    }
}

/// Kind of source a document came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Manual,
    Note,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Note => "note",
        }
    }
}

impl FromStr for SourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "manual" => Ok(Self::Manual),
            "note" => Ok(Self::Note),
            other => Err(Error::ingestion(format!("unknown source kind '{other}'"))),
        }
    }
}

/// Inclusive range of (1-based) pages a chunk was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSpan {
    pub first: u32,
    pub last: u32,
}

impl PageSpan {
    pub fn single(page: u32) -> Self {
        Self { first: page, last: page }
    }
}

impl fmt::Display for PageSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.first == self.last {
            write!(f, "p. {}", self.first)
        } else {
            write!(f, "pp. {}-{}", self.first, self.last)
        }
    }
}

/// Citation metadata carried by every retrieved chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Provenance {
    Manual {
        document_id: DocumentId,
        title: String,
        pages: PageSpan,
        section: Option<String>,
    },
    Note {
        note_id: String,
        created_at: DateTime<Utc>,
    },
}

impl Provenance {
    pub fn note_id(&self) -> Option<&str> {
        match self {
            Self::Note { note_id, .. } => Some(note_id),
            Self::Manual { .. } => None,
        }
    }

    pub fn pages(&self) -> Option<PageSpan> {
        match self {
            Self::Manual { pages, .. } => Some(*pages),
            Self::Note { .. } => None,
        }
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Manual { title, pages, section: Some(section), .. } => {
                write!(f, "{title} ({pages}, {section})")
            }
            Self::Manual { title, pages, section: None, .. } => write!(f, "{title} ({pages})"),
            Self::Note { note_id, created_at } => {
                write!(f, "Note {note_id} ({})", created_at.format("%Y-%m-%d %H:%M"))
            }
        }
    }
}

/// A published document: a manual or a worker note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub title: String,
    pub machine: Option<MachineTag>,
    pub kind: SourceKind,
    pub created_at: DateTime<Utc>,
    /// Set for notes only.
    pub note_id: Option<String>,
}

/// A chunk of a source document that is independently indexed.
///
/// `byte_start..byte_end` locate the text in the source; `overlap_bytes` is
/// the prefix shared with the previous chunk of the same document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub document_id: DocumentId,
    pub ordinal: usize,
    pub text: String,
    pub token_len: usize,
    pub byte_start: usize,
    pub byte_end: usize,
    pub overlap_bytes: usize,
    pub pages: PageSpan,
    pub section: Option<String>,
    pub machine: Option<MachineTag>,
}

impl Chunk {
    pub fn provenance(&self, document: &Document) -> Provenance {
        match (document.kind, &document.note_id) {
            (SourceKind::Note, Some(note_id)) => Provenance::Note {
                note_id: note_id.clone(),
                created_at: document.created_at,
            },
            _ => Provenance::Manual {
                document_id: document.id.clone(),
                title: document.title.clone(),
                pages: self.pages,
                section: self.section.clone(),
            },
        }
    }
}

/// Indicates which index produced a hit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum HitSource {
    Vector,
    Lexical,
}

/// The minimal surface returned by both indices.
///
/// Vector scores are cosine similarities mapped to [0,1]; lexical scores are
/// raw BM25 and unbounded. Higher is always better.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: ChunkId,
    pub score: f32,
    pub source: HitSource,
}

/// One fused query result, constructed fresh per query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub chunk_id: ChunkId,
    pub document_id: DocumentId,
    pub text: String,
    pub machine: Option<MachineTag>,
    pub vector_score: f32,
    pub lexical_score: f32,
    pub fused_score: f32,
    /// 1-based position in the returned list.
    pub rank: usize,
    pub provenance: Provenance,
}
