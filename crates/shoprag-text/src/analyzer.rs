use tantivy::tokenizer::{
	LowerCaser, RemoveLongFilter, SimpleTokenizer, StopWordFilter, TextAnalyzer, TokenStream,
};
use tantivy::Index;

/// Name the pipeline is registered under in every lexical index.
pub const TOKENIZER: &str = "shoprag_text";

const STOP_WORDS: &[&str] = &[
	"a","an","and","are","as","at","be","by","for","from","has","he","in","is","it","its","of","on","that","the","to","was","will","with","or","but","not","this","these","they","them","their","there","then","than","so","if","when","where","why","how","what","which","who","whom","whose","can","could","should","would","may","might","must","shall","do","does","did","have","had","having",
];

/// Tokens longer than this (part numbers glued to paths, base64 blobs) are dropped.
const MAX_TOKEN_LEN: usize = 40;

/// Splits on non-alphanumerics, lower-cases and removes English stop words.
/// The same pipeline runs over chunk text at ingestion and over queries.
#[derive(Clone)]
pub struct Analyzer {
	inner: TextAnalyzer,
}

impl Analyzer {
	pub fn new() -> Self {
		let inner = TextAnalyzer::builder(SimpleTokenizer::default())
			.filter(RemoveLongFilter::limit(MAX_TOKEN_LEN))
			.filter(LowerCaser)
			.filter(StopWordFilter::remove(STOP_WORDS.iter().map(|s| (*s).to_string())))
			.build();
		Self { inner }
	}

	/// Registers the pipeline on `index` under [`TOKENIZER`].
	pub fn register(&self, index: &Index) {
		index.tokenizers().register(TOKENIZER, self.inner.clone());
	}

	pub fn tokens(&self, text: &str) -> Vec<String> {
		// token_stream needs &mut; clones share the boxed pipeline definition
		let mut analyzer = self.inner.clone();
		let mut stream = analyzer.token_stream(text);
		let mut out = Vec::new();
		while stream.advance() {
			out.push(stream.token().text.clone());
		}
		out
	}
}

impl Default for Analyzer {
	fn default() -> Self {
		Self::new()
	}
}

impl std::fmt::Debug for Analyzer {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Analyzer").finish_non_exhaustive()
	}
}
