//! Deep research engine tests: the termination rule over a hand-built
//! tree, and a full run against mock embedder + LLM.

mod common;

use std::sync::Arc;

use chunkhound::research::{
    collect_ancestor_data, detect_new_information, BfsNode, DeepResearchEngine, NodeArena,
    ResearchChunk,
};
use common::*;

fn chunk_in(file: &str, id: i64, start: i64, end: i64) -> ResearchChunk {
    ResearchChunk {
        chunk_id: id,
        file_path: file.to_string(),
        symbol: Some(format!("sym{}", id)),
        chunk_type: "function".to_string(),
        content: "def f(): pass".to_string(),
        start_line: start,
        end_line: end,
        relevance_score: 0.8,
        expanded_range: Some((start, end)),
    }
}

/// Scenario: a parent fully read a file; a child whose only chunk lies in
/// that file must terminate with zero new chunks. Children touching other
/// files or partial overlaps must not terminate.
#[test]
fn test_termination_rule_over_tree() {
    let mut arena = NodeArena::new();

    let mut parent = BfsNode::new("parent".into(), 1, None);
    parent
        .file_contents
        .insert("src/core.py".into(), "entire file content".into());
    parent.chunks = vec![chunk_in("src/other.py", 1, 10, 50)];
    let parent_id = arena.push(parent);

    let child_id = arena.push(BfsNode::new("child".into(), 2, Some(parent_id)));
    let ancestors = collect_ancestor_data(&arena, child_id);

    // Child A: only chunk comes from the fully-read file → terminated.
    let duplicate_chunks = vec![chunk_in("src/core.py", 2, 5, 9)];
    let (new_count, dup_count) = detect_new_information(&duplicate_chunks, &ancestors, false);
    assert_eq!(new_count, 0);
    assert_eq!(dup_count, 1);

    // Child B: chunk contained in the parent's stored expanded range →
    // terminated.
    let contained = vec![chunk_in("src/other.py", 3, 20, 30)];
    let (new_count, dup_count) = detect_new_information(&contained, &ancestors, false);
    assert_eq!(new_count, 0);
    assert_eq!(dup_count, 1);

    // Child C: different file → new.
    let fresh_file = vec![chunk_in("src/new.py", 4, 1, 10)];
    let (new_count, _) = detect_new_information(&fresh_file, &ancestors, false);
    assert_eq!(new_count, 1);

    // Child D: partial overlap counts as new.
    let partial = vec![chunk_in("src/other.py", 5, 40, 70)];
    let (new_count, dup_count) = detect_new_information(&partial, &ancestors, false);
    assert_eq!(new_count, 1);
    assert_eq!(dup_count, 0);
}

#[tokio::test]
async fn test_deep_research_end_to_end_with_mocks() {
    // A tiny project, indexed for real.
    let project = write_project(&[
        (
            "src/auth.py",
            "def login(user, password):\n    return check_token(user)\n\ndef check_token(user):\n    return True\n",
        ),
        (
            "src/storage.py",
            "def save_session(session):\n    pass\n",
        ),
    ]);
    let (store, _db_dir) = temp_store().await;
    let coordinator = coordinator_for(Arc::clone(&store));
    let report = coordinator
        .process_directory(project.path(), None, None)
        .await
        .unwrap();
    assert!(report.total_chunks >= 3);

    // Embed every chunk with the mock provider so semantic search works.
    let embedder = Arc::new(MockEmbedder::new());
    let service = chunkhound::EmbeddingService::new(Arc::clone(&store), embedder.clone());
    let file_paths = store.get_all_file_paths().await.unwrap();
    for path in file_paths {
        let file = store.get_file_by_path(&path).await.unwrap().unwrap();
        let ids: Vec<i64> = store
            .get_chunks_by_file_id(file.id)
            .await
            .unwrap()
            .iter()
            .map(|c| c.id)
            .collect();
        service.embed_chunks(&ids).await.unwrap();
    }

    let llm = Arc::new(
        MockCompleter::new("1. How does check_token validate sessions?")
            .with_rule(
                "Generate 3 code search queries",
                "1. how does authentication work?\n2. login token validation\n3. def login() calls check_token()",
            )
            .with_rule("Select the questions", "1")
            .with_rule(
                "Complete Code Context",
                "## Overview\nAuthentication flows through login() in src/auth.py:1 which calls check_token (src/auth.py:4).\n## Key Findings\nSessions persist via save_session in src/storage.py:1.",
            ),
    );

    let search = search_with_mock_embedder(Arc::clone(&store));
    let engine = DeepResearchEngine::new(
        search,
        embedder,
        llm.clone(),
        project.path().to_path_buf(),
    );

    let report = engine.deep_research("how does authentication work?").await.unwrap();
    assert!(!report.answer.is_empty());
    assert!(
        report.answer.contains("src/auth.py:1") || report.answer.contains("Key files referenced"),
        "answer must carry citations one way or another"
    );
    assert!(report.metadata.nodes_explored >= 1);
    assert!(report.metadata.chunks_analyzed >= 1);
    assert!(report.metadata.depth_reached >= 1 || report.metadata.nodes_explored == 1);

    // The synthesis call happened exactly once.
    let synthesis_calls = llm
        .calls
        .lock()
        .unwrap()
        .iter()
        .filter(|p| p.contains("Complete Code Context"))
        .count();
    assert_eq!(synthesis_calls, 1);
    store.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_deep_research_empty_store_still_answers() {
    let project = write_project(&[]);
    let (store, _db_dir) = temp_store().await;

    let embedder = Arc::new(MockEmbedder::new());
    let llm = Arc::new(MockCompleter::new(
        "## Overview\nNothing indexed yet.",
    ));
    let search = search_with_mock_embedder(Arc::clone(&store));
    let engine = DeepResearchEngine::new(
        search,
        embedder,
        llm,
        project.path().to_path_buf(),
    );

    let report = engine.deep_research("anything at all?").await.unwrap();
    assert!(!report.answer.is_empty());
    assert_eq!(report.metadata.chunks_analyzed, 0);
    store.disconnect().await.unwrap();
}
