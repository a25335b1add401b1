//! The routing pipeline: session context in, ordered tool subset out.

mod decision;
mod domain;

pub use decision::RoutingDecision;
pub use domain::DomainLexicon;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::{
    config::{RouterConfig, RouterMode},
    session::Session,
    zoo::{query_terms, SearchMode, ToolDescriptor, ToolZoo},
};

/// How many candidates retrieval fetches per selected slot.
const CANDIDATE_FACTOR: usize = 4;

pub struct Router {
    config: RouterConfig,
    /// Retrieval floor, taken from the zoo configuration.
    min_score: f32,
    domains: DomainLexicon,
}

impl Router {
    pub fn new(config: RouterConfig, min_score: f32) -> Self {
        Self {
            config,
            min_score,
            domains: DomainLexicon::builtin(),
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Build the routing query from the trailing session messages,
    /// role-prefixed and truncated to the configured character budget.
    pub fn build_query(&self, session: &Session) -> String {
        let parts: Vec<String> = session
            .recent_messages(self.config.query_messages)
            .into_iter()
            .map(|m| format!("{}: {}", m.role, m.content))
            .collect();
        let mut query = parts.join("\n");
        if query.len() > self.config.query_char_budget {
            // Keep the tail: the most recent context is the most relevant.
            let mut start = query.len() - self.config.query_char_budget;
            while !query.is_char_boundary(start) {
                start += 1;
            }
            query = query[start..].to_string();
        }
        query
    }

    /// One deterministic pass: retrieve, boost, diversify, score, fall back.
    /// Identical inputs produce an identical decision.
    pub async fn route(&self, session: &Session, zoo: &ToolZoo) -> RoutingDecision {
        let query = self.build_query(session);
        let active_domains = self.domains.detect(&query_terms(&query));

        let mode = match self.config.mode {
            RouterMode::Keyword => SearchMode::Lexical,
            RouterMode::Semantic => SearchMode::Semantic,
            RouterMode::Hybrid => SearchMode::Hybrid,
        };
        let k_cand = CANDIDATE_FACTOR * self.config.max_tools;
        let retrieved = zoo.search(&query, mode, k_cand, self.min_score).await;

        self.select(&query, &active_domains, retrieved, session, zoo)
    }

    fn select(
        &self,
        query: &str,
        active_domains: &BTreeSet<String>,
        retrieved: Vec<(ToolDescriptor, f32)>,
        session: &Session,
        zoo: &ToolZoo,
    ) -> RoutingDecision {
        struct Candidate {
            descriptor: ToolDescriptor,
            adjusted: f32,
        }

        let candidates: BTreeSet<String> = retrieved
            .iter()
            .map(|(d, _)| d.qualified_name.clone())
            .collect();

        // Static boosts: domain tag intersection and session usage.
        let mut pool: Vec<Candidate> = retrieved
            .into_iter()
            .map(|(descriptor, base)| {
                let mut adjusted = base;
                if descriptor.tags.iter().any(|t| active_domains.contains(t)) {
                    adjusted += self.config.domain_boost;
                }
                let usage = session.usage_count(&descriptor.qualified_name);
                if usage > 0 && self.config.saturation > 0 {
                    let saturation =
                        (usage as f32 / self.config.saturation as f32).min(1.0);
                    adjusted += self.config.usage_boost * saturation;
                }
                Candidate {
                    descriptor,
                    adjusted: adjusted.clamp(0.0, 1.0),
                }
            })
            .collect();

        // Greedy selection. Each pick grants the co-occurrence boost to the
        // remaining candidates that historically co-occurred with it, then
        // the per-server cap decides whether the next best is admissible.
        let mut selected: Vec<String> = Vec::new();
        let mut scores: BTreeMap<String, f32> = BTreeMap::new();
        let mut per_server: HashMap<String, usize> = HashMap::new();

        while selected.len() < self.config.max_tools && !pool.is_empty() {
            pool.sort_by(|a, b| {
                b.adjusted
                    .partial_cmp(&a.adjusted)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.descriptor.server.cmp(&b.descriptor.server))
                    .then_with(|| a.descriptor.qualified_name.cmp(&b.descriptor.qualified_name))
            });

            let Some(position) = pool.iter().position(|c| {
                per_server
                    .get(&c.descriptor.server)
                    .map(|n| *n < self.config.max_per_server)
                    .unwrap_or(true)
            }) else {
                break;
            };

            let picked = pool.remove(position);
            scores.insert(picked.descriptor.qualified_name.clone(), picked.adjusted);
            *per_server
                .entry(picked.descriptor.server.clone())
                .or_insert(0) += 1;

            for candidate in pool.iter_mut() {
                let count = session.co_occurrence_count(
                    &picked.descriptor.qualified_name,
                    &candidate.descriptor.qualified_name,
                );
                if count > 0 {
                    candidate.adjusted = (candidate.adjusted
                        + self.config.cooccurrence_boost)
                        .clamp(0.0, 1.0);
                }
            }
            selected.push(picked.descriptor.qualified_name);
        }

        // Record final scores of the unselected remainder too.
        for candidate in pool {
            scores.insert(candidate.descriptor.qualified_name, candidate.adjusted);
        }

        let confidence = confidence_of(&selected, &scores);

        if confidence < self.config.min_confidence {
            let available: Vec<String> = self
                .config
                .fallback_tools
                .iter()
                .filter(|name| zoo.contains(name))
                .cloned()
                .collect();
            return RoutingDecision {
                selected: available,
                scores,
                candidates,
                reasoning: format!(
                    "confidence {:.2} below threshold {:.2}; fallback set applied",
                    confidence, self.config.min_confidence
                ),
                query_used: query.to_string(),
                confidence,
                triggered_fallback: true,
            };
        }

        let reasoning = if active_domains.is_empty() {
            format!("{} candidates; {} selected", candidates.len(), selected.len())
        } else {
            let domains: Vec<&str> = active_domains.iter().map(String::as_str).collect();
            format!(
                "domains=[{}]; {} candidates; {} selected",
                domains.join(","),
                candidates.len(),
                selected.len()
            )
        };

        RoutingDecision {
            selected,
            scores,
            candidates,
            reasoning,
            query_used: query.to_string(),
            confidence,
            triggered_fallback: false,
        }
    }
}

/// `clip01((top + mean_selected) / 2)`; zero when nothing was selected.
fn confidence_of(selected: &[String], scores: &BTreeMap<String, f32>) -> f32 {
    if selected.is_empty() {
        return 0.0;
    }
    let picked: Vec<f32> = selected
        .iter()
        .filter_map(|name| scores.get(name).copied())
        .collect();
    if picked.is_empty() {
        return 0.0;
    }
    let top = picked.iter().cloned().fold(f32::MIN, f32::max);
    let mean = picked.iter().sum::<f32>() / picked.len() as f32;
    ((top + mean) / 2.0).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::Map;

    use crate::session::MessageRole;
    use crate::zoo::HashEmbedder;

    fn test_zoo() -> ToolZoo {
        ToolZoo::in_memory(0.4, Some(Arc::new(HashEmbedder::new(64))))
    }

    async fn seed(zoo: &ToolZoo, tools: &[(&str, &str, &str, &[&str])]) {
        for (server, name, description, tags) in tools {
            let descriptor = ToolDescriptor::new(
                *server,
                *name,
                *description,
                Map::new(),
                tags.iter().map(|t| t.to_string()).collect(),
            )
            .unwrap();
            zoo.index(descriptor).await.unwrap();
        }
    }

    fn fs_tools() -> Vec<(&'static str, &'static str, &'static str, &'static [&'static str])> {
        vec![
            (
                "fs",
                "read_file",
                "Read the contents of a file from disk.",
                &["files"],
            ),
            (
                "fs",
                "list_directory",
                "List files and directories at a path.",
                &["files"],
            ),
            (
                "fs",
                "write_file",
                "Write content to a file on disk.",
                &["files"],
            ),
            (
                "fs",
                "search_files",
                "Search for files matching a pattern.",
                &["files"],
            ),
        ]
    }

    async fn session_with(messages: &[&str]) -> Session {
        let mut session = Session::new("test");
        for content in messages {
            session.push_message(
                crate::session::ChatMessage {
                    role: MessageRole::User,
                    content: content.to_string(),
                    timestamp: chrono::Utc::now(),
                },
                100,
            );
        }
        session
    }

    fn router(config: RouterConfig) -> Router {
        Router::new(config, 0.0)
    }

    #[tokio::test]
    async fn test_selected_bounded_by_max_tools() {
        let zoo = test_zoo();
        seed(&zoo, &fs_tools()).await;
        let session = session_with(&["list files in /tmp"]).await;
        let r = router(RouterConfig {
            max_tools: 2,
            min_confidence: 0.0,
            ..Default::default()
        });

        let decision = r.route(&session, &zoo).await;
        assert!(decision.selected.len() <= 2);
        assert!(!decision.triggered_fallback);
    }

    #[tokio::test]
    async fn test_scores_and_confidence_bounded() {
        let zoo = test_zoo();
        seed(&zoo, &fs_tools()).await;
        let session = session_with(&["read a file and list the directory"]).await;
        let r = router(RouterConfig {
            min_confidence: 0.0,
            ..Default::default()
        });

        let decision = r.route(&session, &zoo).await;
        assert!((0.0..=1.0).contains(&decision.confidence));
        for score in decision.scores.values() {
            assert!((0.0..=1.0).contains(score));
        }
        assert!(decision
            .selected
            .iter()
            .all(|s| decision.candidates.contains(s)));
    }

    #[tokio::test]
    async fn test_determinism_byte_equal() {
        let zoo = test_zoo();
        seed(&zoo, &fs_tools()).await;
        let mut session = session_with(&["list files in /tmp"]).await;
        session.record_tool_outcome("fs.read_file", true, 5);
        session.record_co_occurrence("fs.read_file", "fs.list_directory");

        let r = router(RouterConfig {
            min_confidence: 0.0,
            ..Default::default()
        });
        let a = r.route(&session, &zoo).await;
        let b = r.route(&session, &zoo).await;
        assert_eq!(
            serde_json::to_vec(&a).unwrap(),
            serde_json::to_vec(&b).unwrap()
        );
    }

    #[tokio::test]
    async fn test_empty_session_routes_to_fallback() {
        let zoo = test_zoo();
        seed(&zoo, &fs_tools()).await;
        let session = session_with(&[]).await;
        let r = router(RouterConfig {
            min_confidence: 0.5,
            fallback_tools: vec!["fs.read_file".into(), "fs.list_directory".into()],
            ..Default::default()
        });

        let decision = r.route(&session, &zoo).await;
        assert!(decision.triggered_fallback);
        assert_eq!(decision.confidence, 0.0);
        assert!(decision.candidates.is_empty());
        assert_eq!(
            decision.selected,
            vec!["fs.read_file".to_string(), "fs.list_directory".to_string()]
        );
    }

    #[tokio::test]
    async fn test_empty_zoo_behaves_like_empty_query() {
        let zoo = test_zoo();
        let session = session_with(&["list files"]).await;
        let r = router(RouterConfig {
            min_confidence: 0.0,
            ..Default::default()
        });
        let decision = r.route(&session, &zoo).await;
        assert!(decision.selected.is_empty());
        assert!(decision.candidates.is_empty());
        assert_eq!(decision.confidence, 0.0);
    }

    #[tokio::test]
    async fn test_fallback_intersects_available() {
        let zoo = test_zoo();
        seed(&zoo, &fs_tools()).await;
        let session = session_with(&[]).await;
        let r = router(RouterConfig {
            min_confidence: 0.9,
            fallback_tools: vec![
                "gh.list_issues".into(),
                "fs.read_file".into(),
            ],
            ..Default::default()
        });

        let decision = r.route(&session, &zoo).await;
        assert!(decision.triggered_fallback);
        // gh.* is not indexed, so only the available tool survives, in order.
        assert_eq!(decision.selected, vec!["fs.read_file".to_string()]);
    }

    #[tokio::test]
    async fn test_fallback_keeps_computed_confidence() {
        let zoo = test_zoo();
        seed(&zoo, &fs_tools()).await;
        let session = session_with(&["unrelated quantum entanglement question"]).await;
        let r = Router::new(
            RouterConfig {
                min_confidence: 0.99,
                fallback_tools: vec!["fs.read_file".into()],
                ..Default::default()
            },
            0.0,
        );

        let decision = r.route(&session, &zoo).await;
        assert!(decision.triggered_fallback);
        assert!(decision.confidence < 0.99);
        assert!(decision.reasoning.contains("fallback"));
    }

    #[tokio::test]
    async fn test_per_server_diversity_cap() {
        let zoo = test_zoo();
        // 18 highly relevant tools on server a, 2 on server b; together they
        // fit the retrieval window so the cap alone decides the split.
        let mut tools: Vec<(String, String)> = Vec::new();
        for i in 0..18 {
            tools.push(("a".to_string(), format!("deploy_service_{:02}", i)));
        }
        tools.push(("b".to_string(), "deploy_main".to_string()));
        tools.push(("b".to_string(), "deploy_backup".to_string()));
        for (server, name) in &tools {
            zoo.index(
                ToolDescriptor::new(
                    server.clone(),
                    name.clone(),
                    "Deploy the service to production.",
                    Map::new(),
                    std::collections::BTreeSet::new(),
                )
                .unwrap(),
            )
            .await
            .unwrap();
        }

        let session = session_with(&["deploy the service"]).await;
        let r = router(RouterConfig {
            max_tools: 5,
            max_per_server: 3,
            min_confidence: 0.0,
            ..Default::default()
        });

        let decision = r.route(&session, &zoo).await;
        assert_eq!(decision.selected.len(), 5);
        let from_a = decision.selected.iter().filter(|n| n.starts_with("a.")).count();
        let from_b = decision.selected.iter().filter(|n| n.starts_with("b.")).count();
        assert_eq!(from_a, 3);
        assert_eq!(from_b, 2);
    }

    #[tokio::test]
    async fn test_max_per_server_is_honored_not_hardcoded() {
        let zoo = test_zoo();
        seed(&zoo, &fs_tools()).await;
        let session = session_with(&["read write list search files"]).await;

        let r = router(RouterConfig {
            max_tools: 5,
            max_per_server: 10,
            min_confidence: 0.0,
            ..Default::default()
        });
        let decision = r.route(&session, &zoo).await;
        // A single-server setup with a generous cap keeps all four tools.
        assert_eq!(decision.selected.len(), 4);

        let r = router(RouterConfig {
            max_tools: 5,
            max_per_server: 1,
            min_confidence: 0.0,
            ..Default::default()
        });
        let decision = r.route(&session, &zoo).await;
        assert_eq!(decision.selected.len(), 1);
    }

    #[tokio::test]
    async fn test_domain_boost_prefers_tagged_server() {
        let zoo = test_zoo();
        // Two tools with identical descriptions; only one is tagged "code".
        seed(
            &zoo,
            &[
                ("gh", "handle_item", "Handle a work item.", &["code"]),
                ("fs", "handle_item", "Handle a work item.", &["files"]),
            ],
        )
        .await;
        let session = session_with(&["open a github pr to handle the item"]).await;
        let r = router(RouterConfig {
            max_tools: 1,
            min_confidence: 0.0,
            ..Default::default()
        });

        let decision = r.route(&session, &zoo).await;
        assert_eq!(decision.selected, vec!["gh.handle_item".to_string()]);
    }

    #[tokio::test]
    async fn test_usage_boost_breaks_symmetry() {
        let zoo = test_zoo();
        seed(
            &zoo,
            &[
                ("a", "mirror_tool", "Do the mirrored operation.", &[]),
                ("b", "mirror_tool", "Do the mirrored operation.", &[]),
            ],
        )
        .await;
        let mut session = session_with(&["do the mirrored operation"]).await;
        for _ in 0..10 {
            session.record_tool_outcome("b.mirror_tool", true, 5);
        }
        let r = router(RouterConfig {
            max_tools: 1,
            min_confidence: 0.0,
            ..Default::default()
        });

        let decision = r.route(&session, &zoo).await;
        assert_eq!(decision.selected, vec!["b.mirror_tool".to_string()]);
    }

    #[tokio::test]
    async fn test_cooccurrence_pulls_in_partner() {
        let zoo = test_zoo();
        seed(
            &zoo,
            &[
                ("fs", "list_directory", "List files at a path.", &[]),
                ("fs", "stat_file", "Inspect one file entry.", &[]),
                ("fs", "chmod_file", "Change one file entry.", &[]),
            ],
        )
        .await;
        let mut session = session_with(&["list files"]).await;
        // stat historically rides along with list.
        for _ in 0..5 {
            session.record_co_occurrence("fs.list_directory", "fs.stat_file");
        }
        let r = router(RouterConfig {
            max_tools: 2,
            min_confidence: 0.0,
            cooccurrence_boost: 0.2,
            ..Default::default()
        });

        let decision = r.route(&session, &zoo).await;
        assert_eq!(decision.selected[0], "fs.list_directory");
        assert_eq!(decision.selected[1], "fs.stat_file");
    }

    #[tokio::test]
    async fn test_query_budget_keeps_recent_tail() {
        let session = {
            let mut s = Session::new("t");
            s.push_message(
                crate::session::ChatMessage {
                    role: MessageRole::User,
                    content: "x".repeat(500),
                    timestamp: chrono::Utc::now(),
                },
                100,
            );
            s.push_message(
                crate::session::ChatMessage {
                    role: MessageRole::User,
                    content: "recent marker".to_string(),
                    timestamp: chrono::Utc::now(),
                },
                100,
            );
            s
        };
        let r = router(RouterConfig {
            query_char_budget: 100,
            ..Default::default()
        });
        let query = r.build_query(&session);
        assert!(query.len() <= 100);
        assert!(query.contains("recent marker"));
    }
}
