//! Fused epilogue benchmarks.
//!
//! Chains: bias only, bias + sum + gelu_tanh, bias + per-oc binary + quantization
//! Row lengths: 64, 256, 1024 over 16 channels
//! Reports: element throughput, sequential vs rayon rows, build latency

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::Rng;
use std::time::Duration;

use gllm_postops::{
    BinaryAlg, BinaryOperand, CpuCaps, CpuIsa, DataType, EltwiseAlg, FormatKind, MemoryDesc,
    PostOpChain, PpCall, PpKernel, PpKernelConf, QuantizationAlg, QuantizationParams,
};

const CHANNELS: usize = 16;
const ROW_LENS: &[usize] = &[64, 256, 1024];

fn random_f32_vec(n: usize) -> Vec<f32> {
    let mut rng = rand::thread_rng();
    (0..n).map(|_| rng.gen_range(-2.0f32..2.0)).collect()
}

fn conf(len: usize) -> PpKernelConf {
    PpKernelConf {
        dst_desc: MemoryDesc::new(&[1, CHANNELS, len], DataType::F32, FormatKind::Ncsp),
        with_bias: true,
        dst_dt: DataType::F32,
    }
}

fn chains() -> Vec<(&'static str, PostOpChain)> {
    let q = QuantizationParams::new(
        QuantizationAlg::QuantizeDequantize,
        [false, false, true, false, true, false],
        CHANNELS,
    );
    vec![
        ("bias", PostOpChain::builder().build()),
        (
            "sum_gelu",
            PostOpChain::builder()
                .sum(1.0, 0)
                .eltwise(EltwiseAlg::GeluTanh, 0.0, 0.0)
                .build(),
        ),
        (
            "binary_quant",
            PostOpChain::builder()
                .binary(
                    BinaryAlg::Mul,
                    MemoryDesc::new(&[1, CHANNELS, 1], DataType::F32, FormatKind::Ncsp),
                )
                .quantization(q)
                .build(),
        ),
    ]
}

struct Inputs {
    src: Vec<f32>,
    bias: Vec<f32>,
    sum: Vec<f32>,
    per_oc: Vec<f32>,
    quant: Vec<f32>,
}

impl Inputs {
    fn new(len: usize) -> Self {
        let q = QuantizationParams::new(
            QuantizationAlg::QuantizeDequantize,
            [false, false, true, false, true, false],
            CHANNELS,
        );
        let mut quant = vec![0.0; q.buffer_len(CHANNELS)];
        quant[q.offsets[0]] = -4.0;
        quant[q.offsets[1]] = 4.0;
        for v in &mut quant[q.offsets[2]..q.offsets[3]] {
            *v = 16.0;
        }
        for v in &mut quant[q.offsets[4]..q.offsets[5]] {
            *v = 1.0 / 16.0;
        }
        Inputs {
            src: random_f32_vec(CHANNELS * len),
            bias: random_f32_vec(CHANNELS),
            sum: random_f32_vec(CHANNELS * len),
            per_oc: random_f32_vec(CHANNELS),
            quant,
        }
    }
}

fn run(kernel: &PpKernel, inputs: &Inputs, dst: &mut [f32], len: usize, parallel: bool) {
    let has_binary = kernel.chain().binary_like_count() > 0;
    let has_aux = kernel.chain().aux_pointer_count() > 0;
    let has_sum = kernel.chain().first_sum().is_some();
    let rhs = [BinaryOperand::F32(&inputs.per_oc)];
    let aux: [&[f32]; 1] = [&inputs.quant];
    let call = PpCall {
        dst,
        bias: Some(&inputs.bias[..]),
        len,
        oc_start: 0,
        oc_work: CHANNELS,
        oc_stride: len,
        binary_rhs: if has_binary { &rhs[..] } else { &[] },
        post_ops_data: if has_aux { &aux[..] } else { &[] },
        sum_src: has_sum.then_some(&inputs.sum[..]),
    };
    let stats = if parallel {
        kernel.execute_par(call)
    } else {
        kernel.execute(call)
    };
    if let Err(e) = stats {
        panic!("pp kernel failed: {e}");
    }
}

fn bench_execute(c: &mut Criterion) {
    let caps = CpuCaps::with_isa(CpuIsa::Avx512Core);
    for (name, chain) in chains() {
        let mut group = c.benchmark_group(format!("pp_kernel/{name}"));
        group.warm_up_time(Duration::from_millis(500));
        group.measurement_time(Duration::from_secs(3));

        for &len in ROW_LENS {
            let Some(kernel) = PpKernel::create_with_caps(&caps, conf(len), chain.clone())
                .unwrap_or_else(|e| panic!("build {name}: {e}"))
            else {
                continue;
            };
            let inputs = Inputs::new(len);
            let mut dst = inputs.src.clone();
            group.throughput(Throughput::Elements((CHANNELS * len) as u64));

            for parallel in [false, true] {
                let id = if parallel { "rayon" } else { "sequential" };
                group.bench_with_input(BenchmarkId::new(id, len), &len, |bench, &len| {
                    bench.iter(|| {
                        dst.copy_from_slice(&inputs.src);
                        run(&kernel, &inputs, black_box(&mut dst), len, parallel);
                        black_box(&dst);
                    });
                });
            }
        }
        group.finish();
    }
}

fn bench_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("pp_kernel/build");
    for isa in [CpuIsa::Sse41, CpuIsa::Avx2, CpuIsa::Avx512Core] {
        let caps = CpuCaps::with_isa(isa);
        for (name, chain) in chains() {
            group.bench_with_input(BenchmarkId::new(name, isa), &chain, |bench, chain| {
                bench.iter(|| {
                    let k = PpKernel::create_with_caps(&caps, conf(256), black_box(chain.clone()));
                    black_box(k.is_ok());
                });
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_execute, bench_build);
criterion_main!(benches);
