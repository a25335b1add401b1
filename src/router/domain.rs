//! Keyword-lexicon domain detection.
//!
//! A fixed, small lexicon maps query keywords to domain tags. Detected
//! domains are matched against tool tags during re-ranking; the lexicon is
//! deliberately coarse and is not a classifier.

use std::collections::BTreeSet;

pub struct DomainLexicon {
    domains: Vec<(&'static str, &'static [&'static str])>,
}

impl DomainLexicon {
    pub fn builtin() -> Self {
        Self {
            domains: vec![
                (
                    "email",
                    &["email", "mail", "inbox", "send", "reply", "draft", "attachment"],
                ),
                (
                    "code",
                    &[
                        "code", "commit", "pr", "branch", "repo", "repository", "github",
                        "issue", "issues", "merge", "diff", "review", "bug",
                    ],
                ),
                (
                    "files",
                    &[
                        "file", "files", "directory", "directories", "folder", "path",
                        "read", "write", "list",
                    ],
                ),
                (
                    "web",
                    &["http", "url", "fetch", "browse", "website", "web", "download"],
                ),
                (
                    "data",
                    &["query", "sql", "database", "table", "csv", "rows", "records"],
                ),
                (
                    "chat",
                    &["message", "channel", "slack", "thread", "dm", "notify"],
                ),
                (
                    "infra",
                    &[
                        "deploy", "server", "container", "docker", "kubernetes", "logs",
                        "restart", "scale",
                    ],
                ),
            ],
        }
    }

    /// Domains whose keyword set intersects the query tokens.
    pub fn detect(&self, query_tokens: &[String]) -> BTreeSet<String> {
        let tokens: BTreeSet<&str> = query_tokens.iter().map(String::as_str).collect();
        self.domains
            .iter()
            .filter(|(_, keywords)| keywords.iter().any(|k| tokens.contains(k)))
            .map(|(name, _)| name.to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zoo::query_terms;

    #[test]
    fn test_detects_single_domain() {
        let lexicon = DomainLexicon::builtin();
        let domains = lexicon.detect(&query_terms("check my inbox for new mail"));
        assert!(domains.contains("email"));
        assert!(!domains.contains("infra"));
    }

    #[test]
    fn test_detects_multiple_domains() {
        let lexicon = DomainLexicon::builtin();
        let domains = lexicon.detect(&query_terms("read the file and open a github issue"));
        assert!(domains.contains("files"));
        assert!(domains.contains("code"));
    }

    #[test]
    fn test_no_match_is_empty() {
        let lexicon = DomainLexicon::builtin();
        assert!(lexicon.detect(&query_terms("what is the weather")).is_empty());
        assert!(lexicon.detect(&[]).is_empty());
    }
}
