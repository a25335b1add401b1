//! Tokenized inverted index over tool text fields.

use std::collections::{HashMap, HashSet};

/// Lowercased alphanumeric tokens; underscores and every other separator
/// split, so `list_directory` matches the query term `list`.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_alphanumeric() {
            current.extend(ch.to_lowercase());
        } else if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Unique query tokens in first-seen order.
pub fn query_terms(query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    tokenize(query)
        .into_iter()
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

#[derive(Default)]
pub struct LexicalIndex {
    /// term -> documents containing it
    postings: HashMap<String, HashSet<String>>,
    /// document -> its term set
    docs: HashMap<String, HashSet<String>>,
}

impl LexicalIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index a document from its textual fields, replacing any prior entry.
    pub fn insert<'a>(
        &mut self,
        qualified_name: &str,
        fields: impl IntoIterator<Item = &'a str>,
    ) {
        self.remove(qualified_name);
        let mut terms = HashSet::new();
        for field in fields {
            terms.extend(tokenize(field));
        }
        for term in &terms {
            self.postings
                .entry(term.clone())
                .or_default()
                .insert(qualified_name.to_string());
        }
        self.docs.insert(qualified_name.to_string(), terms);
    }

    pub fn remove(&mut self, qualified_name: &str) {
        let Some(terms) = self.docs.remove(qualified_name) else {
            return;
        };
        for term in terms {
            if let Some(posting) = self.postings.get_mut(&term) {
                posting.remove(qualified_name);
                if posting.is_empty() {
                    self.postings.remove(&term);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    fn idf(&self, term: &str) -> f64 {
        let n = self.docs.len() as f64;
        let df = self.postings.get(term).map(|p| p.len()).unwrap_or(0) as f64;
        (1.0 + n / (1.0 + df)).ln()
    }

    /// Score every document that matches at least one query term.
    ///
    /// Per document: sum of idf over matched query terms, normalized by the
    /// idf mass of the whole query, which keeps scores in [0,1].
    pub fn scores(&self, terms: &[String]) -> HashMap<String, f32> {
        if terms.is_empty() || self.docs.is_empty() {
            return HashMap::new();
        }
        let total_idf: f64 = terms.iter().map(|t| self.idf(t)).sum();
        if total_idf <= 0.0 {
            return HashMap::new();
        }

        let mut accumulated: HashMap<String, f64> = HashMap::new();
        for term in terms {
            let Some(posting) = self.postings.get(term) else {
                continue;
            };
            let idf = self.idf(term);
            for doc in posting {
                *accumulated.entry(doc.clone()).or_default() += idf;
            }
        }

        accumulated
            .into_iter()
            .map(|(doc, sum)| (doc, ((sum / total_idf) as f32).clamp(0.0, 1.0)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_index() -> LexicalIndex {
        let mut index = LexicalIndex::new();
        index.insert(
            "fs.list_directory",
            ["list_directory", "List directory contents", "files"],
        );
        index.insert(
            "fs.read_file",
            ["read_file", "Read the contents of a file", "files"],
        );
        index.insert(
            "gh.create_issue",
            ["create_issue", "Create a new GitHub issue", "code"],
        );
        index
    }

    #[test]
    fn test_tokenize_splits_separators() {
        assert_eq!(tokenize("list_directory"), vec!["list", "directory"]);
        assert_eq!(tokenize("List files in /tmp!"), vec!["list", "files", "in", "tmp"]);
        assert!(tokenize("  ").is_empty());
    }

    #[test]
    fn test_query_terms_dedup() {
        assert_eq!(query_terms("list list files"), vec!["list", "files"]);
    }

    #[test]
    fn test_scores_rank_matching_docs() {
        let index = sample_index();
        let scores = index.scores(&query_terms("list directory"));
        let list_score = scores["fs.list_directory"];
        assert!(list_score > 0.9, "full match should be near 1, got {}", list_score);
        assert!(!scores.contains_key("gh.create_issue"));
    }

    #[test]
    fn test_rare_terms_weigh_more() {
        let index = sample_index();
        // "github" appears in one doc, "files" in two.
        let scores = index.scores(&query_terms("github files"));
        assert!(scores["gh.create_issue"] > scores["fs.read_file"]);
    }

    #[test]
    fn test_scores_bounded() {
        let index = sample_index();
        for (_, score) in index.scores(&query_terms("list directory contents files read")) {
            assert!((0.0..=1.0).contains(&score));
        }
    }

    #[test]
    fn test_empty_query_and_empty_index() {
        let index = sample_index();
        assert!(index.scores(&[]).is_empty());
        let empty = LexicalIndex::new();
        assert!(empty.scores(&query_terms("anything")).is_empty());
    }

    #[test]
    fn test_reinsert_replaces() {
        let mut index = sample_index();
        index.insert("fs.read_file", ["totally different words"]);
        let scores = index.scores(&query_terms("read file contents"));
        assert!(!scores.contains_key("fs.read_file"));
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn test_remove_cleans_postings() {
        let mut index = sample_index();
        index.remove("gh.create_issue");
        assert!(index.scores(&query_terms("github issue")).is_empty());
        assert_eq!(index.len(), 2);
    }
}
