//! Candidate responses: embedding-space deduplication, a rolling ranked
//! buffer, and the single-flight gate around per-message generation.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Mutex;

/// Cosine similarity of two dense vectors; 0 when either has zero norm.
/// Extra components of the longer vector are ignored.
pub fn cosine(a: &[f64], b: &[f64]) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

/// A generated response together with its embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub embedding: Vec<f64>,
    pub text: String,
}

impl Candidate {
    pub fn new(embedding: Vec<f64>, text: impl Into<String>) -> Self {
        Self {
            embedding,
            text: text.into(),
        }
    }
}

fn is_duplicate(kept: &[Candidate], embedding: &[f64], threshold: f64) -> bool {
    kept.iter().any(|k| cosine(&k.embedding, embedding) > threshold)
}

/// Keep candidates in first-seen order, dropping any whose cosine similarity
/// to an already kept one exceeds `threshold`.
pub fn filter_similar_candidates(candidates: Vec<Candidate>, threshold: f64) -> Vec<Candidate> {
    let mut kept: Vec<Candidate> = Vec::with_capacity(candidates.len());
    for cand in candidates {
        if !is_duplicate(&kept, &cand.embedding, threshold) {
            kept.push(cand);
        }
    }
    kept
}

/// Bounded rolling buffer of recent candidates; the oldest is evicted first.
#[derive(Debug, Clone)]
pub struct CandidateBuffer {
    capacity: usize,
    threshold: f64,
    items: VecDeque<Candidate>,
}

impl CandidateBuffer {
    pub fn new(capacity: usize, threshold: f64) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            threshold,
            items: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, candidate: Candidate) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(candidate);
    }

    pub fn extend(&mut self, candidates: impl IntoIterator<Item = Candidate>) {
        for c in candidates {
            self.push(c);
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Up to `topn` buffered candidates, most similar to `query` first,
    /// skipping any that duplicate a higher-ranked one.
    ///
    /// Unlike [`filter_similar_candidates`] the output follows similarity
    /// rank, not insertion order.
    pub fn rank_candidates(&self, query: &[f64], topn: usize) -> Vec<Candidate> {
        let mut scored: Vec<(f64, &Candidate)> =
            self.items.iter().map(|c| (cosine(query, &c.embedding), c)).collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut out: Vec<Candidate> = Vec::with_capacity(topn.min(scored.len()));
        for (_, cand) in scored {
            if out.len() == topn {
                break;
            }
            if !is_duplicate(&out, &cand.embedding, self.threshold) {
                out.push(cand.clone());
            }
        }
        out
    }
}

/// Serializes candidate generation: at most one run is in flight per
/// pipeline, later callers wait their turn.
#[derive(Debug, Default)]
pub struct CandidatePipeline {
    gate: Mutex<()>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl CandidatePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` once the gate is free.
    pub async fn run<F, T>(&self, work: F) -> T
    where
        F: Future<Output = T>,
    {
        let _gate = self.gate.lock().await;
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        let _active = ActiveGuard(&self.active);
        self.peak.fetch_max(now, Ordering::SeqCst);
        work.await
    }

    /// Highest number of simultaneously running generations observed.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn cosine_basics() {
        assert!((cosine(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-12);
        assert_eq!(cosine(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn filter_keeps_first_seen() {
        let cands = vec![
            Candidate::new(vec![1.0, 0.0], "a"),
            Candidate::new(vec![0.99, 0.01], "a2"),
            Candidate::new(vec![0.0, 1.0], "b"),
            Candidate::new(vec![0.7, 0.7], "c"),
        ];
        let kept = filter_similar_candidates(cands, 0.98);
        let texts: Vec<_> = kept.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, ["a", "b", "c"]);
        for (i, x) in kept.iter().enumerate() {
            for y in &kept[i + 1..] {
                assert!(cosine(&x.embedding, &y.embedding) <= 0.98);
            }
        }
    }

    #[test]
    fn rank_orders_by_similarity_then_dedups() {
        let mut buf = CandidateBuffer::new(8, 0.98);
        buf.extend([
            Candidate::new(vec![0.0, 1.0], "far"),
            Candidate::new(vec![1.0, 0.1], "near"),
            Candidate::new(vec![1.0, 0.1001], "near-dup"),
            Candidate::new(vec![0.6, 0.8], "mid"),
        ]);
        let ranked = buf.rank_candidates(&[1.0, 0.0], 3);
        let texts: Vec<_> = ranked.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, ["near", "mid", "far"]);
        assert_eq!(buf.rank_candidates(&[1.0, 0.0], 1).len(), 1);
    }

    #[test]
    fn buffer_evicts_oldest() {
        let mut buf = CandidateBuffer::new(2, 0.98);
        buf.push(Candidate::new(vec![1.0], "one"));
        buf.push(Candidate::new(vec![1.0], "two"));
        buf.push(Candidate::new(vec![1.0], "three"));
        assert_eq!(buf.len(), 2);
        let ranked = buf.rank_candidates(&[1.0], 5);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].text, "two");
    }

    #[tokio::test]
    async fn pipeline_never_overlaps() {
        let pipeline = Arc::new(CandidatePipeline::new());
        let mut handles = Vec::new();
        for i in 0..6u64 {
            let p = Arc::clone(&pipeline);
            handles.push(tokio::spawn(async move {
                p.run(async {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    i
                })
                .await
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(pipeline.peak_concurrency(), 1);
    }
}
