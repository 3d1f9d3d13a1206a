//! Context retrieval: recent stored messages ranked against the query, and
//! an optional opensearch-style HTTP endpoint.
//!
//! Both paths degrade to an empty list on any failure.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::memory::MessageStore;
use crate::metrics::{lowercase, tokenize};
use crate::predict::{PredictionIndex, SharedIndex, lock_index, sparse_cosine};

/// Number of recent messages considered by [`retrieve_context`].
pub const RECENT_WINDOW: usize = 50;

/// Rank `messages` against `words`: shared-word count plus the cosine
/// similarity of the summed neighbor vectors. Messages scoring zero are
/// dropped; ties keep message order.
pub fn rank_context(
    index: &PredictionIndex,
    words: &[String],
    messages: &[String],
    limit: usize,
) -> Vec<String> {
    let query = lowercase(words);
    let qset: HashSet<&str> = query.iter().map(String::as_str).collect();
    let qvec = index.context_vector(&query);

    let mut scored: Vec<(f64, &String)> = messages
        .iter()
        .filter_map(|msg| {
            let mwords = lowercase(&tokenize(msg));
            let overlap = mwords
                .iter()
                .map(String::as_str)
                .collect::<HashSet<_>>()
                .intersection(&qset)
                .count() as f64;
            let mvec = index.context_vector(&mwords);
            let score = if qvec.is_empty() || mvec.is_empty() {
                overlap
            } else {
                overlap + sparse_cosine(&qvec, &mvec)
            };
            (score > 0.0).then_some((score, msg))
        })
        .collect();
    scored.sort_by(|a, b| b.0.total_cmp(&a.0));
    scored.into_iter().take(limit).map(|(_, m)| m.clone()).collect()
}

/// Up to `limit` recent messages relevant to `words`. Ranking runs on the
/// blocking pool.
pub async fn retrieve_context(
    store: &dyn MessageStore,
    index: &SharedIndex,
    words: &[String],
    limit: usize,
) -> Vec<String> {
    let recent = match store.fetch_recent(RECENT_WINDOW).await {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(error = %e, "recent messages unavailable");
            return Vec::new();
        }
    };
    let index = Arc::clone(index);
    let words = words.to_vec();
    let ranked =
        tokio::task::spawn_blocking(move || rank_context(&lock_index(&index), &words, &recent, limit)).await;
    ranked.unwrap_or_else(|e| {
        tracing::warn!(error = %e, "context ranking task failed");
        Vec::new()
    })
}

fn fetch_descriptions(endpoint: &str, query: &str, timeout: Duration) -> Result<Vec<String>, String> {
    let agent = ureq::AgentBuilder::new().timeout(timeout).build();
    let body: serde_json::Value = agent
        .get(endpoint)
        .query("action", "opensearch")
        .query("format", "json")
        .query("search", query)
        .call()
        .map_err(|e| e.to_string())?
        .into_json()
        .map_err(|e| e.to_string())?;
    // [query, [titles], [descriptions], [urls]]
    let descriptions = body
        .get(2)
        .and_then(|d| d.as_array())
        .ok_or_else(|| "unexpected opensearch payload".to_string())?;
    Ok(descriptions
        .iter()
        .filter_map(|d| d.as_str())
        .filter(|d| !d.is_empty())
        .map(str::to_string)
        .collect())
}

/// Query `endpoint` for `query`; empty on error or when `timeout` expires.
pub async fn retrieve_external(endpoint: &str, query: &str, timeout: Duration) -> Vec<String> {
    let endpoint = endpoint.to_string();
    let q = query.to_string();
    let call = tokio::task::spawn_blocking(move || fetch_descriptions(&endpoint, &q, timeout));
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(Ok(found))) => found,
        Ok(Ok(Err(e))) => {
            tracing::debug!(error = %e, query, "external retrieval failed");
            Vec::new()
        }
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "external retrieval task failed");
            Vec::new()
        }
        Err(_) => {
            tracing::debug!(millis = timeout.as_millis() as u64, query, "external retrieval timed out");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpListener;

    use super::*;
    use crate::memory::{MemoryStore, TAG_MESSAGE};
    use crate::predict::Graph;

    fn toks(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    fn index() -> PredictionIndex {
        let mut idx = PredictionIndex::from_graph(Graph::new());
        for line in ["sun warm sky", "rain cold sky", "code compiles fast"] {
            idx.update(&tokenize(line)).unwrap();
        }
        idx
    }

    #[test]
    fn ranks_by_overlap_then_similarity() {
        let idx = index();
        let messages = toks(&["the sun is warm", "rain again", "code compiles", "nothing here"]);
        let ranked = rank_context(&idx, &toks(&["Sun", "warm"]), &messages, 5);
        assert_eq!(ranked[0], "the sun is warm");
        assert!(!ranked.contains(&"nothing here".to_string()));
        assert_eq!(rank_context(&idx, &toks(&["sun"]), &messages, 1).len(), 1);
    }

    #[tokio::test]
    async fn context_from_store() {
        let store = MemoryStore::new();
        for m in ["sun warm today", "compile the code"] {
            store.add_message(m, TAG_MESSAGE).await.unwrap();
        }
        let idx: SharedIndex = Arc::new(std::sync::Mutex::new(index()));
        let found = retrieve_context(&store, &idx, &toks(&["code"]), 3).await;
        assert_eq!(found, ["compile the code"]);
    }

    #[tokio::test]
    async fn poisoned_index_still_ranks_context() {
        let store = MemoryStore::new();
        store.add_message("compile the code", TAG_MESSAGE).await.unwrap();
        let idx: SharedIndex = Arc::new(std::sync::Mutex::new(index()));
        let clone = Arc::clone(&idx);
        let _ = std::thread::spawn(move || {
            let _guard = clone.lock().unwrap();
            panic!("ranking thread died");
        })
        .join();

        let found = retrieve_context(&store, &idx, &toks(&["code"]), 3).await;
        assert_eq!(found, ["compile the code"]);
    }

    fn serve_once(delay: Duration, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf);
                std::thread::sleep(delay);
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn external_returns_descriptions() {
        let url = serve_once(Duration::ZERO, r#"["test", [], ["desc"], []]"#);
        let found = retrieve_external(&url, "test", Duration::from_secs(2)).await;
        assert_eq!(found, ["desc"]);
    }

    #[tokio::test]
    async fn external_timeout_is_empty() {
        let url = serve_once(Duration::from_millis(500), r#"["test", [], ["desc"], []]"#);
        let found = retrieve_external(&url, "test", Duration::from_millis(50)).await;
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn external_unreachable_is_empty() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let found = retrieve_external(&format!("http://{addr}/"), "q", Duration::from_millis(200)).await;
        assert!(found.is_empty());
    }
}
