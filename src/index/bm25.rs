//! BM25 keyword index, persisted as a sidecar next to the vector store.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

const DEFAULT_K1: f32 = 1.2;
const DEFAULT_B: f32 = 0.75;

/// In-memory BM25 index over record ids, serialized to `bm25.index`.
#[derive(Debug, Serialize, Deserialize)]
pub struct Bm25Index {
    doc_freq: HashMap<String, usize>,
    doc_count: usize,
    avg_doc_len: f32,
    doc_lengths: HashMap<String, usize>,
    term_freqs: HashMap<String, HashMap<String, usize>>,
    k1: f32,
    b: f32,
}

impl Default for Bm25Index {
    fn default() -> Self {
        Self {
            doc_freq: HashMap::new(),
            doc_count: 0,
            avg_doc_len: 0.0,
            doc_lengths: HashMap::new(),
            term_freqs: HashMap::new(),
            k1: DEFAULT_K1,
            b: DEFAULT_B,
        }
    }
}

impl Bm25Index {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn doc_count(&self) -> usize {
        self.doc_count
    }

    pub fn contains(&self, doc_id: &str) -> bool {
        self.term_freqs.contains_key(doc_id)
    }

    /// Add (or replace) a document.
    pub fn add_document(&mut self, doc_id: &str, text: &str) {
        if self.term_freqs.contains_key(doc_id) {
            self.remove_document(doc_id);
        }

        let terms = tokenize(text);
        let doc_len = terms.len();
        self.doc_lengths.insert(doc_id.to_string(), doc_len);

        let mut term_freq: HashMap<String, usize> = HashMap::new();
        let mut seen: HashSet<&str> = HashSet::new();
        for term in &terms {
            *term_freq.entry(term.clone()).or_insert(0) += 1;
            if seen.insert(term.as_str()) {
                *self.doc_freq.entry(term.clone()).or_insert(0) += 1;
            }
        }

        self.term_freqs.insert(doc_id.to_string(), term_freq);
        self.doc_count += 1;
        self.recompute_avg_len();
    }

    pub fn remove_document(&mut self, doc_id: &str) {
        if let Some(term_freq) = self.term_freqs.remove(doc_id) {
            for term in term_freq.keys() {
                if let Some(freq) = self.doc_freq.get_mut(term) {
                    *freq = freq.saturating_sub(1);
                    if *freq == 0 {
                        self.doc_freq.remove(term);
                    }
                }
            }
            self.doc_count = self.doc_count.saturating_sub(1);
        }
        self.doc_lengths.remove(doc_id);
        self.recompute_avg_len();
    }

    fn recompute_avg_len(&mut self) {
        if self.doc_count > 0 {
            let total: usize = self.doc_lengths.values().sum();
            self.avg_doc_len = total as f32 / self.doc_count as f32;
        } else {
            self.avg_doc_len = 0.0;
        }
    }

    /// Top `max_results` `(doc_id, score)` pairs, score descending. Documents
    /// with zero score are omitted.
    pub fn search(&self, query: &str, max_results: usize) -> Vec<(String, f32)> {
        let query_terms = tokenize(query);
        if query_terms.is_empty() || self.doc_count == 0 {
            return Vec::new();
        }

        let mut scores: HashMap<&str, f32> = HashMap::new();
        for term in &query_terms {
            let df = *self.doc_freq.get(term).unwrap_or(&0);
            if df == 0 {
                continue;
            }
            let idf = ((self.doc_count as f32 - df as f32 + 0.5) / (df as f32 + 0.5) + 1.0).ln();

            for (doc_id, term_freqs) in &self.term_freqs {
                if let Some(&tf) = term_freqs.get(term) {
                    let doc_len = *self.doc_lengths.get(doc_id).unwrap_or(&1) as f32;
                    let tf_normalized = (tf as f32 * (self.k1 + 1.0))
                        / (tf as f32
                            + self.k1
                                * (1.0 - self.b + self.b * (doc_len / self.avg_doc_len.max(1.0))));
                    *scores.entry(doc_id.as_str()).or_insert(0.0) += idf * tf_normalized;
                }
            }
        }

        let mut results: Vec<(String, f32)> = scores
            .into_iter()
            .filter(|(_, score)| *score > 0.0)
            .map(|(id, score)| (id.to_string(), score))
            .collect();
        // Stable tiebreak on id so equal scores order deterministically.
        results.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        results.truncate(max_results);
        results
    }

    /// Load the persisted index, or an empty one when the sidecar is absent
    /// or unreadable.
    pub fn load(path: &Path) -> Self {
        match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|error| {
                tracing::warn!(%error, path = %path.display(), "bm25 sidecar unreadable, rebuilding");
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Persist the index as JSON.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec(self)?;
        std::fs::write(path, bytes)
    }
}

/// Lowercased alphanumeric tokens. Unicode word characters are kept so
/// non-ASCII content remains searchable.
fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::Bm25Index;

    #[test]
    fn indexed_documents_are_searchable() {
        let mut index = Bm25Index::new();
        index.add_document("a:1:0", "revenue grew 18% in Q3");
        index.add_document("b:2:0", "meeting notes for the offsite");

        let hits = index.search("revenue Q3", 5);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "a:1:0");
        assert!(hits[0].1 > 0.0);
    }

    #[test]
    fn removed_documents_stop_matching() {
        let mut index = Bm25Index::new();
        index.add_document("a:1:0", "alpha beta");
        index.add_document("a:1:1", "alpha gamma");

        index.remove_document("a:1:0");
        let hits = index.search("beta", 5);
        assert!(hits.is_empty());

        let hits = index.search("alpha", 5);
        assert_eq!(hits.len(), 1);
        assert_eq!(index.doc_count(), 1);
    }

    #[test]
    fn re_adding_a_document_replaces_it() {
        let mut index = Bm25Index::new();
        index.add_document("a:1:0", "old words");
        index.add_document("a:1:0", "new words");
        assert_eq!(index.doc_count(), 1);
        assert!(index.search("old", 5).is_empty());
        assert_eq!(index.search("new", 5).len(), 1);
    }

    #[test]
    fn sidecar_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bm25.index");

        let mut index = Bm25Index::new();
        index.add_document("a:1:0", "persistent keyword content");
        index.save(&path).expect("save");

        let loaded = Bm25Index::load(&path);
        assert_eq!(loaded.doc_count(), 1);
        assert_eq!(loaded.search("persistent", 5).len(), 1);
    }

    #[test]
    fn missing_sidecar_loads_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let loaded = Bm25Index::load(&dir.path().join("absent.index"));
        assert_eq!(loaded.doc_count(), 0);
    }
}
