use std::sync::Arc;

use shoprag_core::traits::{IndexEntry, Scope, TextIndexer};
use shoprag_core::types::{ChunkId, MachineFilter, MachineTag, SearchHit};
use shoprag_text::{Analyzer, LexicalIndex};

fn tag(s: &str) -> MachineTag {
	MachineTag::parse(s).expect("tag")
}

fn entry<'a>(id: ChunkId, text: &'a str, machine: Option<&'a MachineTag>) -> IndexEntry<'a> {
	IndexEntry { id, text, vector: &[], machine }
}

fn index_of(entries: &[(ChunkId, &str)]) -> LexicalIndex {
	let index = LexicalIndex::new().expect("index");
	let entries: Vec<IndexEntry<'_>> = entries.iter().map(|(id, text)| entry(*id, text, None)).collect();
	index.insert(&entries).expect("insert");
	index
}

fn search(index: &LexicalIndex, query: &str, k: usize) -> Vec<SearchHit> {
	let all = MachineFilter::All;
	index.search(query, k, &Scope::unrestricted(&all)).expect("search")
}

fn ids(hits: &[SearchHit]) -> Vec<ChunkId> {
	hits.iter().map(|h| h.id).collect()
}

#[test]
fn analyzer_lowercases_and_drops_stop_words() {
	let tokens = Analyzer::new().tokens("Check the Coolant level, and the SPINDLE!");
	assert_eq!(tokens, vec!["check", "coolant", "level", "spindle"]);
}

#[test]
fn matching_chunk_ranks_first_and_rare_terms_weigh_more() {
	let index = index_of(&[
		(1, "spindle warmup procedure run at low rpm"),
		(2, "coolant concentration procedure"),
		(3, "way lube procedure and daily checks"),
	]);
	let hits = search(&index, "spindle procedure", 3);
	assert_eq!(hits[0].id, 1);
	assert_eq!(hits.len(), 3, "every chunk shares the common term");
	assert!(hits[0].score > hits[1].score);
	assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
}

#[test]
fn no_overlap_yields_no_hits() {
	let index = index_of(&[(1, "spindle warmup")]);
	assert!(search(&index, "hydraulic pressure", 5).is_empty());
	assert!(search(&index, "spindle", 0).is_empty());
	assert!(search(&index, "the and of", 5).is_empty());
	assert!(search(&LexicalIndex::new().expect("index"), "spindle", 5).is_empty());
}

#[test]
fn machine_filter_applies_before_top_k() {
	let index = LexicalIndex::new().expect("index");
	let vf2 = tag("haas-vf2");
	let mut entries: Vec<IndexEntry<'_>> =
		(1..=5).map(|id| entry(id, "spindle spindle spindle bearing", Some(&vf2))).collect();
	entries.push(entry(10, "spindle overview for all machines with a long general introduction", None));
	index.insert(&entries).expect("insert");

	let ur = MachineFilter::Machine(tag("ur10e"));
	let hits = index.search("spindle", 1, &Scope::unrestricted(&ur)).expect("search");
	assert_eq!(ids(&hits), vec![10]);

	let vf2_filter = MachineFilter::Machine(vf2.clone());
	let hits = index.search("spindle", 10, &Scope::unrestricted(&vf2_filter)).expect("search");
	assert_eq!(hits.len(), 6);
}

#[test]
fn machine_scope_does_not_change_scores() {
	let index = LexicalIndex::new().expect("index");
	let vf2 = tag("haas-vf2");
	index.insert(&[entry(1, "coolant pump impeller", Some(&vf2)), entry(2, "coolant filter", None)]).expect("insert");
	let scoped = MachineFilter::Machine(vf2.clone());
	let unscoped = search(&index, "coolant impeller", 2);
	let scoped = index.search("coolant impeller", 2, &Scope::unrestricted(&scoped)).expect("search");
	assert_eq!(unscoped, scoped);
}

#[test]
fn unpublished_entries_never_take_a_slot() {
	let texts: Vec<(ChunkId, &str)> = (1..=40).map(|id| (id, "spindle alarm")).collect();
	let index = index_of(&texts);
	let all = MachineFilter::All;
	let only_last = |id: u64| id == 40;
	let hits = index.search("spindle", 1, &Scope::new(&all, &only_last)).expect("search");
	assert_eq!(ids(&hits), vec![40]);
}

#[test]
fn equal_scores_break_ties_by_id() {
	let texts: Vec<(ChunkId, &str)> = [7, 3, 5, 30, 12, 1].into_iter().map(|id| (id, "tool changer alignment")).collect();
	let index = index_of(&texts);
	assert_eq!(ids(&search(&index, "alignment", 3)), vec![1, 3, 5]);
}

#[test]
fn removed_and_replaced_entries_leave_no_trace_in_scores() {
	let index = index_of(&[(1, "one two three"), (2, "four five"), (3, "spindle one")]);
	index.remove(&[2]).expect("remove");
	index.remove(&[2]).expect("removing twice is harmless");
	index.insert(&[entry(1, "six spindle", None)]).expect("reinsert");
	assert_eq!(index.len(), 2);
	assert!(search(&index, "four", 5).is_empty());
	assert!(search(&index, "three", 5).is_empty());

	let fresh = index_of(&[(1, "six spindle"), (3, "spindle one")]);
	assert_eq!(search(&index, "spindle one", 5), search(&fresh, "spindle one", 5));
}

#[test]
fn queries_run_while_other_threads_insert() {
	let index = Arc::new(LexicalIndex::new().expect("index"));
	let writers: Vec<_> = (0..4u64)
		.map(|t| {
			let index = Arc::clone(&index);
			std::thread::spawn(move || {
				for i in 0..25u64 {
					let text = format!("belt tension check {t} {i}");
					index.insert(&[entry(t * 100 + i, &text, None)]).expect("insert");
				}
			})
		})
		.collect();
	let reader = {
		let index = Arc::clone(&index);
		std::thread::spawn(move || {
			for _ in 0..50 {
				let hits = search(&index, "belt tension", 10);
				assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
			}
		})
	};
	for handle in writers {
		handle.join().expect("writer");
	}
	reader.join().expect("reader");
	assert_eq!(index.len(), 100);
	assert_eq!(search(&index, "belt", 200).len(), 100);
}
