use sqlx::SqlitePool;
use tempfile::TempDir;

use grounded_chat::db;
use grounded_chat::migrate::migrate_pool;
use grounded_chat::models::{NewChunk, Role};
use grounded_chat::sessions::{SessionStore, SqliteSessionStore};
use grounded_chat::store::sqlite::SqliteStore;
use grounded_chat::store::CandidateStore;

async fn setup() -> (TempDir, SqlitePool) {
    let tmp = TempDir::new().unwrap();
    let pool = db::connect_path(&tmp.path().join("data").join("test.sqlite"))
        .await
        .unwrap();
    migrate_pool(&pool).await.unwrap();
    (tmp, pool)
}

fn chunk(content: &str, embedding: Vec<f32>, source: &str) -> NewChunk {
    NewChunk {
        content: content.to_string(),
        embedding,
        source_file: source.to_string(),
    }
}

fn ids(candidates: &[grounded_chat::models::RetrievalCandidate]) -> Vec<i64> {
    candidates.iter().map(|c| c.id).collect()
}

#[tokio::test]
async fn test_migrations_are_idempotent() {
    let (_tmp, pool) = setup().await;
    migrate_pool(&pool).await.unwrap();
    migrate_pool(&pool).await.unwrap();

    let tables: Vec<String> = sqlx::query_scalar(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name IN ('chunks', 'chunks_fts', 'chat_sessions', 'chat_messages') ORDER BY name",
    )
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(tables, vec!["chat_messages", "chat_sessions", "chunks", "chunks_fts"]);
}

#[tokio::test]
async fn test_embedding_round_trips_through_blob() {
    let (_tmp, pool) = setup().await;
    let store = SqliteStore::new(pool);
    let id = store
        .insert_chunk(&chunk("vacation policy", vec![0.6, 0.8], "hr.md"))
        .await
        .unwrap();

    let got = store.vector_search(&[0.6, 0.8], 10, None).await.unwrap();
    assert_eq!(ids(&got), vec![id]);
    assert!(got[0].distance.abs() < 1e-6);
    assert_eq!(got[0].source_file, "hr.md");
}

#[tokio::test]
async fn test_hybrid_search_scores_non_matching_chunks() {
    let (_tmp, pool) = setup().await;
    let store = SqliteStore::new(pool);
    let hit = store
        .insert_chunk(&chunk("Kubernetes deployment guide", vec![0.0, 1.0], "ops.md"))
        .await
        .unwrap();
    let lunch = store
        .insert_chunk(&chunk("Lunch menu for Friday", vec![1.0, 0.0], "misc.md"))
        .await
        .unwrap();

    // 0.7 * 1.0 beats 0.3 * 1.0
    let got = store
        .hybrid_search(&[1.0, 0.0], "kubernetes?", 25, 0.7, None)
        .await
        .unwrap();
    assert_eq!(ids(&got), vec![lunch, hit]);

    let got = store
        .hybrid_search(&[1.0, 0.0], "kubernetes?", 25, 0.0, None)
        .await
        .unwrap();
    assert_eq!(ids(&got), vec![hit, lunch]);

    let none = store
        .hybrid_search(&[1.0, 0.0], "nonexistentterm", 25, 0.7, None)
        .await
        .unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn test_hybrid_weight_one_matches_vector_order() {
    let (_tmp, pool) = setup().await;
    let store = SqliteStore::new(pool);
    for (text, emb) in [
        ("rust rust rust", vec![0.0f32, 1.0]),
        ("rust", vec![1.0, 0.0]),
        ("rust rust", vec![0.7, 0.7]),
    ] {
        store.insert_chunk(&chunk(text, emb, "r.md")).await.unwrap();
    }

    let q = [1.0f32, 0.0];
    let hybrid = store.hybrid_search(&q, "rust", 25, 1.0, None).await.unwrap();
    let vector = store.vector_search(&q, 25, None).await.unwrap();
    assert_eq!(ids(&hybrid), ids(&vector));
}

#[tokio::test]
async fn test_hybrid_weight_one_matches_vector_order_on_mixed_corpus() {
    let (_tmp, pool) = setup().await;
    let store = SqliteStore::new(pool);
    let mut inserted = Vec::new();
    for (text, emb) in [
        ("alpha text", vec![0.0f32, 1.0]),
        ("unrelated words", vec![1.0, 0.0]),
        ("more alpha", vec![0.5, 0.5]),
    ] {
        inserted.push(store.insert_chunk(&chunk(text, emb, "m.md")).await.unwrap());
    }

    let q = [1.0f32, 0.0];
    let hybrid = store.hybrid_search(&q, "alpha", 25, 1.0, None).await.unwrap();
    let vector = store.vector_search(&q, 25, None).await.unwrap();
    assert_eq!(ids(&vector), vec![inserted[1], inserted[2], inserted[0]]);
    assert_eq!(ids(&hybrid), ids(&vector));
}

#[tokio::test]
async fn test_allow_list_restricts_both_queries() {
    let (_tmp, pool) = setup().await;
    let store = SqliteStore::new(pool);
    store
        .insert_chunk(&chunk("budget report", vec![1.0, 0.0], "a.pdf"))
        .await
        .unwrap();
    let b = store
        .insert_chunk(&chunk("budget forecast", vec![1.0, 0.0], "b.pdf"))
        .await
        .unwrap();

    let allowed = vec!["b.pdf".to_string()];
    let hybrid = store
        .hybrid_search(&[1.0, 0.0], "budget", 25, 0.7, Some(allowed.as_slice()))
        .await
        .unwrap();
    assert_eq!(ids(&hybrid), vec![b]);

    let vector = store.vector_search(&[1.0, 0.0], 25, Some(allowed.as_slice())).await.unwrap();
    assert_eq!(ids(&vector), vec![b]);

    // an empty list means no restriction
    let all = store.vector_search(&[1.0, 0.0], 25, Some(&[][..])).await.unwrap();
    assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn test_delete_source_removes_keyword_index_entries() {
    let (_tmp, pool) = setup().await;
    let store = SqliteStore::new(pool.clone());
    store
        .insert_chunk(&chunk("kiwi orchard notes", vec![1.0], "fruit.md"))
        .await
        .unwrap();
    store
        .insert_chunk(&chunk("kiwi harvest", vec![1.0], "fruit.md"))
        .await
        .unwrap();
    store
        .insert_chunk(&chunk("apple notes", vec![1.0], "other.md"))
        .await
        .unwrap();

    let sources = store.list_sources().await.unwrap();
    assert_eq!(sources.len(), 2);
    assert_eq!(sources[0].name, "fruit.md");
    assert_eq!(sources[0].chunks, 2);

    assert_eq!(store.delete_source("fruit.md").await.unwrap(), 2);
    assert_eq!(store.delete_source("fruit.md").await.unwrap(), 0);

    let indexed: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM chunks_fts WHERE chunks_fts MATCH 'kiwi'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(indexed, 0);
    assert_eq!(store.list_sources().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_update_reindexes_content() {
    let (_tmp, pool) = setup().await;
    let store = SqliteStore::new(pool.clone());
    let id = store
        .insert_chunk(&chunk("old wording", vec![1.0], "doc.md"))
        .await
        .unwrap();

    sqlx::query("UPDATE chunks SET content = 'fresh wording' WHERE id = ?")
        .bind(id)
        .execute(&pool)
        .await
        .unwrap();

    let old = store.hybrid_search(&[1.0], "old", 10, 0.5, None).await.unwrap();
    assert!(old.is_empty());
    let fresh = store.hybrid_search(&[1.0], "fresh", 10, 0.5, None).await.unwrap();
    assert_eq!(ids(&fresh), vec![id]);
}

#[tokio::test]
async fn test_sample_contents_is_bounded() {
    let (_tmp, pool) = setup().await;
    let store = SqliteStore::new(pool);
    assert!(store.sample_contents(5).await.unwrap().is_empty());
    for i in 0..8 {
        store
            .insert_chunk(&chunk(&format!("chunk {}", i), vec![1.0], "s.md"))
            .await
            .unwrap();
    }
    assert_eq!(store.sample_contents(5).await.unwrap().len(), 5);
}

#[tokio::test]
async fn test_latest_source_is_last_ingested_file() {
    let (_tmp, pool) = setup().await;
    let store = SqliteStore::new(pool);
    assert_eq!(store.latest_source().await.unwrap(), None);
    store.insert_chunk(&chunk("intro", vec![1.0], "guide.pdf")).await.unwrap();
    store.insert_chunk(&chunk("region,total", vec![1.0], "sales.csv")).await.unwrap();
    assert_eq!(store.latest_source().await.unwrap().as_deref(), Some("sales.csv"));
}

#[tokio::test]
async fn test_session_messages_ordered_and_cascade_deleted() {
    let (_tmp, pool) = setup().await;
    let sessions = SqliteSessionStore::new(pool.clone());

    let session = sessions.create_session("Onboarding").await.unwrap();
    sessions
        .append_message(session.id, Role::User, "How do I get a laptop?")
        .await
        .unwrap();
    sessions
        .append_message(session.id, Role::Model, "Ask IT.")
        .await
        .unwrap();

    let messages = sessions.messages(session.id).await.unwrap();
    let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Model]);

    assert_eq!(sessions.list_sessions().await.unwrap().len(), 1);
    assert!(sessions.delete_session(session.id).await.unwrap());
    assert!(!sessions.delete_session(session.id).await.unwrap());
    assert!(sessions.get_session(session.id).await.unwrap().is_none());

    let orphans: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chat_messages")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(orphans, 0);
}

#[tokio::test]
async fn test_message_for_unknown_session_rejected() {
    let (_tmp, pool) = setup().await;
    let sessions = SqliteSessionStore::new(pool);
    assert!(sessions.append_message(404, Role::User, "hi").await.is_err());
}
