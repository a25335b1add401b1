//! End-to-end routing scenarios over an in-memory zoo and session state,
//! with a deterministic embedding function.

use std::{collections::BTreeSet, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Map;

use toolgate::{
    config::RouterConfig,
    session::{ChatMessage, MessageRole, Session},
    zoo::EmbeddingProvider,
    GatewayResult, Router, SearchMode, ToolDescriptor, ToolZoo,
};

/// Token-hash bag-of-words embedder: deterministic, with overlapping texts
/// producing correlated vectors and unrelated texts near-orthogonal ones.
struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    fn new(dims: usize) -> Self {
        Self { dims }
    }

    fn bucket(&self, token: &str) -> usize {
        let mut hash: u64 = 1469598103934665603;
        for byte in token.bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(1099511628211);
        }
        (hash % self.dims as u64) as usize
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    async fn embed(&self, text: &str) -> GatewayResult<Vec<f32>> {
        let mut v = vec![0.0f32; self.dims];
        for raw in text.split(|c: char| !c.is_alphanumeric()) {
            let token = raw.to_lowercase();
            if !token.is_empty() {
                v[self.bucket(&token)] += 1.0;
            }
        }
        Ok(v)
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn model_name(&self) -> &str {
        "hash-test"
    }
}

fn zoo() -> ToolZoo {
    ToolZoo::in_memory(0.4, Some(Arc::new(HashEmbedder::new(128))))
}

async fn index(zoo: &ToolZoo, server: &str, name: &str, description: &str, tags: &[&str]) {
    let tags: BTreeSet<String> = tags.iter().map(|t| t.to_string()).collect();
    let descriptor =
        ToolDescriptor::new(server, name, description, Map::new(), tags).unwrap();
    zoo.index(descriptor).await.unwrap();
}

async fn seed_fs(zoo: &ToolZoo) {
    index(
        zoo,
        "fs",
        "read_file",
        "Read the contents of a file from disk.",
        &["files"],
    )
    .await;
    index(
        zoo,
        "fs",
        "list_directory",
        "List files and directories at a path.",
        &["files"],
    )
    .await;
    index(
        zoo,
        "fs",
        "write_file",
        "Write content to a file on disk.",
        &["files"],
    )
    .await;
    index(
        zoo,
        "fs",
        "search_files",
        "Search for files matching a glob pattern.",
        &["files"],
    )
    .await;
}

async fn seed_gh(zoo: &ToolZoo) {
    index(
        zoo,
        "gh",
        "create_issue",
        "Create a new GitHub issue in a repository.",
        &["code"],
    )
    .await;
    index(
        zoo,
        "gh",
        "list_issues",
        "List open GitHub issues in a repository.",
        &["code"],
    )
    .await;
    index(
        zoo,
        "gh",
        "get_issue",
        "Get a GitHub issue by number.",
        &["code"],
    )
    .await;
    index(
        zoo,
        "gh",
        "update_issue",
        "Update the title or body of a GitHub issue.",
        &["code"],
    )
    .await;
}

fn session(messages: &[&str]) -> Session {
    let mut session = Session::new("scenario");
    for content in messages {
        session.push_message(
            ChatMessage {
                role: MessageRole::User,
                content: content.to_string(),
                timestamp: Utc::now(),
            },
            100,
        );
    }
    session
}

// Single-server happy path: a file-listing request selects the whole fs
// toolset with the listing tool ranked first and healthy confidence.
#[tokio::test]
async fn single_server_happy_path() {
    let zoo = zoo();
    seed_fs(&zoo).await;

    let router = Router::new(
        RouterConfig {
            max_tools: 5,
            max_per_server: 10,
            min_confidence: 0.2,
            ..Default::default()
        },
        0.0,
    );
    let session = session(&["list files in /tmp"]);

    let decision = router.route(&session, &zoo).await;
    assert!(!decision.triggered_fallback);
    assert_eq!(decision.selected.len(), 4);
    assert_eq!(decision.selected[0], "fs.list_directory");
    assert!(decision.confidence >= 0.5, "confidence {}", decision.confidence);
    // Scores arrive in rank order.
    let ranked: Vec<f32> = decision
        .selected
        .iter()
        .map(|name| decision.scores[name])
        .collect();
    for pair in ranked.windows(2) {
        assert!(pair[0] >= pair[1]);
    }
}

// Cross-domain switch: after the conversation turns to GitHub, only gh
// tools are offered even though fs tools remain indexed.
#[tokio::test]
async fn cross_domain_switch() {
    let zoo = zoo();
    seed_fs(&zoo).await;
    seed_gh(&zoo).await;

    let router = Router::new(
        RouterConfig {
            max_tools: 4,
            max_per_server: 10,
            min_confidence: 0.2,
            ..Default::default()
        },
        0.0,
    );
    let session = session(&[
        "view the project tree",
        "now create a GitHub issue for the README",
    ]);

    let decision = router.route(&session, &zoo).await;
    assert!(!decision.triggered_fallback);
    assert!(!decision.selected.is_empty());
    assert!(
        decision.selected.iter().all(|name| name.starts_with("gh.")),
        "expected only gh tools, got {:?}",
        decision.selected
    );
    assert!(decision.confidence > 0.4, "confidence {}", decision.confidence);
}

// Low-confidence fallback: an off-topic question cannot clear the
// confidence bar, so the configured fallback set is served instead.
#[tokio::test]
async fn low_confidence_fallback() {
    let zoo = zoo();
    seed_fs(&zoo).await;

    let router = Router::new(
        RouterConfig {
            max_tools: 5,
            min_confidence: 0.5,
            fallback_tools: vec![
                "fs.read_file".to_string(),
                "fs.list_directory".to_string(),
            ],
            ..Default::default()
        },
        0.0,
    );
    let session = session(&["what's the weather like tomorrow?"]);

    let decision = router.route(&session, &zoo).await;
    assert!(decision.triggered_fallback);
    assert!(decision.confidence < 0.5);
    assert_eq!(
        decision.selected,
        vec!["fs.read_file".to_string(), "fs.list_directory".to_string()]
    );
    assert!(decision.reasoning.contains("fallback"));
}

// Diversity cap: one dominant server cannot crowd out the rest.
#[tokio::test]
async fn per_server_diversity_cap() {
    let zoo = zoo();
    for i in 0..18 {
        index(
            &zoo,
            "bulk",
            &format!("sync_records_{:02}", i),
            "Synchronize records into the data warehouse.",
            &[],
        )
        .await;
    }
    index(
        &zoo,
        "side",
        "sync_summary",
        "Synchronize the records summary report.",
        &[],
    )
    .await;
    index(
        &zoo,
        "side",
        "sync_audit",
        "Synchronize the records audit trail.",
        &[],
    )
    .await;

    let router = Router::new(
        RouterConfig {
            max_tools: 5,
            max_per_server: 3,
            min_confidence: 0.0,
            ..Default::default()
        },
        0.0,
    );
    let session = session(&["synchronize the records"]);

    let decision = router.route(&session, &zoo).await;
    assert_eq!(decision.selected.len(), 5);
    let bulk = decision
        .selected
        .iter()
        .filter(|n| n.starts_with("bulk."))
        .count();
    let side = decision
        .selected
        .iter()
        .filter(|n| n.starts_with("side."))
        .count();
    assert_eq!(bulk, 3, "dominant server must be capped: {:?}", decision.selected);
    assert_eq!(side, 2);
}

// Adaptive learning: tools that succeeded together in this session rise
// together in later decisions.
#[tokio::test]
async fn learning_shapes_later_decisions() {
    let zoo = zoo();
    seed_fs(&zoo).await;

    let router = Router::new(
        RouterConfig {
            max_tools: 2,
            min_confidence: 0.0,
            cooccurrence_boost: 0.2,
            ..Default::default()
        },
        0.0,
    );

    let mut session = session(&["list files in /tmp"]);
    let baseline = router.route(&session, &zoo).await;
    assert_eq!(baseline.selected[0], "fs.list_directory");

    // The assistant kept writing files right after listing them.
    for _ in 0..5 {
        session.record_tool_outcome("fs.write_file", true, 8);
        session.record_co_occurrence("fs.list_directory", "fs.write_file");
    }

    let adapted = router.route(&session, &zoo).await;
    assert_eq!(adapted.selected[0], "fs.list_directory");
    assert_eq!(adapted.selected[1], "fs.write_file");
}

// Determinism across separately constructed but identical inputs.
#[tokio::test]
async fn identical_inputs_identical_decisions() {
    let make = || async {
        let zoo = zoo();
        seed_fs(&zoo).await;
        seed_gh(&zoo).await;
        let router = Router::new(
            RouterConfig {
                max_tools: 5,
                min_confidence: 0.2,
                ..Default::default()
            },
            0.0,
        );
        let session = session(&["read the README file then create an issue"]);
        router.route(&session, &zoo).await
    };

    let a = make().await;
    let b = make().await;
    assert_eq!(
        serde_json::to_vec(&a).unwrap(),
        serde_json::to_vec(&b).unwrap()
    );
}

// The zoo search surface honors its own contract independent of routing.
#[tokio::test]
async fn zoo_search_contract() {
    let zoo = zoo();
    seed_fs(&zoo).await;

    assert!(zoo.search("", SearchMode::Hybrid, 10, 0.0).await.is_empty());

    let results = zoo
        .search("read the file contents", SearchMode::Hybrid, 2, 0.0)
        .await;
    assert!(results.len() <= 2);
    assert_eq!(results[0].0.qualified_name, "fs.read_file");

    let stats = zoo.stats();
    assert_eq!(stats.total, 4);
    assert_eq!(stats.embedded_count, 4);
    assert_eq!(stats.per_server["fs"], 4);
}
