use candle_core::{DType, Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use layers::{
    dtypes::PrecisionPolicy,
    norm::{LayerNorm, NormConfig, NormalizationLayer},
    residual::{Dropout, PostNormResidual},
};

fn bench_norms(c: &mut Criterion) {
    let device = Device::Cpu;
    let batch = 8usize;
    let seq = 128usize;
    let hidden_sizes = &[384usize, 768, 1024];
    let dtypes = &[DType::F16, DType::BF16, DType::F32];

    for &dtype in dtypes {
        let mut group = c.benchmark_group(format!("post_norm/{dtype:?}"));
        for &hidden in hidden_sizes {
            let input = Tensor::randn(0f32, 1.0, (batch, seq, hidden), &device)
                .expect("input")
                .to_dtype(dtype)
                .expect("cast input");
            let residual_input = Tensor::randn(0f32, 1.0, (batch, seq, hidden), &device)
                .expect("residual")
                .to_dtype(dtype)
                .expect("cast residual");
            let policy = PrecisionPolicy::from_parameter_dtype(dtype);

            let weight = Tensor::ones((hidden,), dtype, &device).expect("weight");
            let bias = Tensor::zeros((hidden,), dtype, &device).expect("bias");
            let layer_norm =
                LayerNorm::new(weight, bias, NormConfig::new(hidden, 1e-5)).expect("layer norm");
            let post_norm = PostNormResidual::new(
                layer_norm.clone(),
                Dropout::new(0.1).expect("dropout"),
            );

            group.throughput(Throughput::Elements((batch * seq * hidden) as u64));

            group.bench_with_input(
                BenchmarkId::new("layer_norm", hidden),
                &(layer_norm, input.clone(), policy),
                |b, (norm, input, policy)| {
                    b.iter(|| {
                        let out = norm.forward(black_box(input), policy).expect("forward");
                        black_box(out);
                    });
                },
            );

            group.bench_with_input(
                BenchmarkId::new("residual_then_norm", hidden),
                &(post_norm, input, residual_input, policy),
                |b, (step, input, residual, policy)| {
                    b.iter(|| {
                        let out = step
                            .forward(black_box(input), residual, policy)
                            .expect("forward");
                        black_box(out);
                    });
                },
            );
        }
        group.finish();
    }
}

criterion_group!(benches, bench_norms);
criterion_main!(benches);
