//! Benchmarks for topology synthesis.

use caption_stack::lifecycle::plan;
use caption_stack::{CaptionTopology, StackConfig};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn synth_benchmark(c: &mut Criterion) {
    let topology = CaptionTopology::new(StackConfig::default());
    c.bench_function("synthesize", |b| b.iter(|| black_box(topology.synthesize())));

    let Ok(stack) = topology.synthesize() else {
        return;
    };
    c.bench_function("fingerprint", |b| b.iter(|| black_box(stack.fingerprint())));

    let changed = StackConfig::default().with_artifact_key("models/v2/model.tar.gz");
    let Ok(next) = CaptionTopology::new(changed).synthesize() else {
        return;
    };
    c.bench_function("plan", |b| b.iter(|| black_box(plan(&stack, &next))));
}

criterion_group!(benches, synth_benchmark);
criterion_main!(benches);
