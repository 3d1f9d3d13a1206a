//! Benchmarks for sentence planning and candidate deduplication.

use criterion::{Criterion, black_box, criterion_group, criterion_main};

use pro_engine::candidates::{Candidate, CandidateBuffer, filter_similar_candidates};
use pro_engine::memory::HashingEmbedder;
use pro_engine::metrics::{lowercase, tokenize};
use pro_engine::planner::SentencePlanner;
use pro_engine::planner::phrase::{ResponseParams, respond};
use pro_engine::predict::{Graph, PredictionIndex};
use pro_engine::sequence::{SequenceModel, analyze_sequences};

const CORPUS: &str = "\
the quiet harbor holds old boats
old boats drift under grey skies
grey skies bring rain over the harbor
sailors mend nets near the harbor wall
the lighthouse turns its slow beam
a slow beam sweeps across dark water
dark water carries the boats home
";

fn corpus() -> (SequenceModel, PredictionIndex) {
    let mut model = SequenceModel::new();
    let mut index = PredictionIndex::from_graph(Graph::new());
    for line in CORPUS.lines() {
        let tokens = lowercase(&tokenize(line));
        analyze_sequences(&mut model, &tokens, 3, 1.0, None);
        index.update(&tokens).unwrap();
    }
    (model, index)
}

fn bench_respond(c: &mut Criterion) {
    let (model, index) = corpus();
    let planner = SentencePlanner::new(&model, Some(&index));
    let seeds = vec!["harbor".to_string(), "boats".to_string()];
    let forbidden = Default::default();
    let params = ResponseParams::default();

    c.bench_function("respond_two_clauses", |bench| {
        bench.iter(|| black_box(respond(&planner, &seeds, &forbidden, &params)))
    });
}

fn bench_dedup(c: &mut Criterion) {
    let embedder = HashingEmbedder::default();
    let texts: Vec<String> = CORPUS.lines().cycle().take(32).map(str::to_string).collect();
    let candidates: Vec<Candidate> = texts
        .iter()
        .map(|t| Candidate::new(embedder.embed_sync(t), t.clone()))
        .collect();
    let query = embedder.embed_sync("boats in the harbor");

    c.bench_function("filter_similar_32", |bench| {
        bench.iter(|| black_box(filter_similar_candidates(candidates.clone(), 0.98)))
    });

    let mut buffer = CandidateBuffer::new(32, 0.98);
    buffer.extend(candidates.clone());
    c.bench_function("rank_buffer_32", |bench| {
        bench.iter(|| black_box(buffer.rank_candidates(&query, 5)))
    });
}

criterion_group!(benches, bench_respond, bench_dedup);
criterion_main!(benches);
