// Criterion benchmarks for the hot synchronous paths: node scoring, rank
// fusion, and chunking. These run on every report for every channel and
// candidate, so regressions here multiply across the fleet.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use moniteur::atoms::types::Hit;
use moniteur::engine::config::HeuristicWeights;
use moniteur::engine::decisions::{min_max_normalize, score_node};
use moniteur::engine::ingest::chunker::chunk_text;
use moniteur::engine::retrieval::rrf_fuse;

fn hit(i: usize, leg: &str) -> Hit {
    Hit {
        chunk_id: format!("{}-{}", leg, i),
        document_id: format!("doc{}", i % 40),
        ordinal: (i % 7) as u32,
        text: "routing fees respond to liquidity pressure".into(),
        score: 1.0 / (i + 1) as f64,
        doc_type: "node_doc".into(),
        related_node: None,
        language: "en".into(),
        source_uri: "file:///bench".into(),
    }
}

fn bench_scoring(c: &mut Criterion) {
    let weights = HeuristicWeights::default();
    let capacities: Vec<f64> = (0..256).map(|i| (i * 1_000_000) as f64).collect();

    c.bench_function("score_node_cohort_256", |b| {
        b.iter(|| {
            let norms = min_max_normalize(black_box(&capacities));
            norms
                .iter()
                .enumerate()
                .map(|(i, &cap)| {
                    score_node(&weights, 0.4, cap, 0.7, (i % 2500) as u32, 0.95)
                })
                .sum::<f64>()
        })
    });
}

fn bench_fusion(c: &mut Criterion) {
    let vector: Vec<Hit> = (0..24).map(|i| hit(i, "v")).collect();
    let lexical: Vec<Hit> = (8..32).map(|i| hit(i, "v")).collect(); // 2/3 overlap

    c.bench_function("rrf_fuse_24x24", |b| {
        b.iter(|| rrf_fuse(black_box(&vector), black_box(&lexical), 0.5, 8))
    });
}

fn bench_chunker(c: &mut Criterion) {
    let text = "Channels with stale fee policies bleed routing revenue. \
                Liquidity moves toward the cheapest reliable path. "
        .repeat(600); // ~64 KB of prose

    c.bench_function("chunk_64kb_document", |b| {
        b.iter(|| chunk_text(black_box(&text)))
    });
}

criterion_group!(benches, bench_scoring, bench_fusion, bench_chunker);
criterion_main!(benches);
