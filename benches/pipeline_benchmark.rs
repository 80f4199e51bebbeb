//! Throughput benchmarks for the pure, in-process parts of the pipeline
//! hot path: job construction and the dedup/canonicalization helpers the
//! ingestion gate calls on every candidate item.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use shortform_pipeline::dedup::{canonicalize_url, news_dedup_key};
use shortform_pipeline::job::Job;

fn bench_job_new(c: &mut Criterion) {
    c.bench_function("job_new", |b| {
        b.iter(|| {
            Job::new(
                black_box("news-shorts"),
                black_box("Example headline about a developing story"),
                black_box("A short summary of the developing story for context."),
                black_box("https://example.com/articles/12345"),
            )
        })
    });
}

fn bench_canonicalize_url(c: &mut Criterion) {
    c.bench_function("canonicalize_url", |b| {
        b.iter(|| canonicalize_url(black_box("https://example.com/a/b?utm_source=x&id=5#frag")))
    });
}

fn bench_news_dedup_key(c: &mut Criterion) {
    c.bench_function("news_dedup_key", |b| {
        b.iter(|| {
            news_dedup_key(
                black_box("newsapi"),
                black_box("Example headline about a developing story"),
                black_box(Some("https://example.com/articles/12345")),
                black_box(Some("2026-07-31T00:00:00Z")),
            )
        })
    });
}

criterion_group!(benches, bench_job_new, bench_canonicalize_url, bench_news_dedup_key);
criterion_main!(benches);
