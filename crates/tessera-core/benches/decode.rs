//! Incremental decoding through the full stack: append vs static cache.
//!
//! The append cache concatenates every step; the static cache writes into a
//! preallocated buffer and scores against its full capacity.

use candle_core::{DType, Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tessera_core::attention::AttentionImpl;
use tessera_core::cache::{CacheMode, KvCache};
use tessera_core::diagnostics::Diagnostics;
use tessera_core::model::{AttentionConfig, DecoderStack, StackInput, StackOptions};

const HIDDEN: usize = 256;

fn create_stack() -> DecoderStack {
    let config = AttentionConfig {
        attn_implementation: AttentionImpl::ScaledDotProduct,
        num_hidden_layers: 4,
        max_position_embeddings: 2048,
        ..AttentionConfig::tiny(HIDDEN, 8, 2)
    };
    DecoderStack::random(config, DType::F32, &Device::Cpu, Diagnostics::memory()).unwrap()
}

/// Prefill `prompt_len` tokens, then time `steps` single-token steps.
fn bench_decode_vs_cache_mode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_vs_cache_mode");
    let stack = create_stack();
    let steps = 16;
    group.throughput(Throughput::Elements(steps as u64));

    let modes = |prompt_len: usize| {
        [
            ("append", CacheMode::Append),
            ("static", CacheMode::Static { max_len: prompt_len + steps }),
        ]
    };

    for prompt_len in [32, 128, 512] {
        let prompt = Tensor::randn(0f32, 1.0, (1, prompt_len, HIDDEN), &Device::Cpu).unwrap();
        let token = Tensor::randn(0f32, 1.0, (1, 1, HIDDEN), &Device::Cpu).unwrap();

        for (name, mode) in modes(prompt_len) {
            group.bench_with_input(BenchmarkId::new(name, prompt_len), &prompt_len, |b, _| {
                b.iter_batched(
                    || {
                        let mut cache = KvCache::new(stack.num_layers(), mode).unwrap();
                        stack
                            .forward(StackInput::new(&prompt), Some(&mut cache), StackOptions::default())
                            .unwrap();
                        cache
                    },
                    |mut cache| {
                        for _ in 0..steps {
                            let out = stack
                                .forward(StackInput::new(black_box(&token)), Some(&mut cache), StackOptions::default())
                                .unwrap();
                            black_box(out);
                        }
                    },
                    criterion::BatchSize::LargeInput,
                )
            });
        }
    }

    group.finish();
}

criterion_group!(benches, bench_decode_vs_cache_mode);

criterion_main!(benches);
