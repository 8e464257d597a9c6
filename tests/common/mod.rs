//! Scalar reference of the epilogue, shared by the integration suites.

#![allow(dead_code)]

use gllm_postops::injectors::quantization::do_rounding;
use gllm_postops::post_ops::QuantField;
use gllm_postops::{
    BinaryAlg, CpuCaps, CpuIsa, DataType, DepthwiseAlg, EltwiseAlg, FormatKind, MemoryDesc,
    PostOp, PostOpChain, PpKernel, PpKernelConf,
};

pub fn ncsp(dims: &[usize]) -> MemoryDesc {
    MemoryDesc::new(dims, DataType::F32, FormatKind::Ncsp)
}

pub fn conf(dims: &[usize], with_bias: bool) -> PpKernelConf {
    PpKernelConf {
        dst_desc: ncsp(dims),
        with_bias,
        dst_dt: DataType::F32,
    }
}

/// Kernel for a CPU offering exactly `isa`.
pub fn kernel(isa: CpuIsa, conf: PpKernelConf, chain: PostOpChain) -> PpKernel {
    PpKernel::create_with_caps(&CpuCaps::with_isa(isa), conf, chain)
        .expect("build")
        .expect("a vectorized variant")
}

pub fn eltwise(alg: EltwiseAlg, x: f32, alpha: f32, beta: f32) -> f32 {
    let logistic = |v: f32| 1.0 / (1.0 + (-v).exp());
    match alg {
        EltwiseAlg::Relu => if x > 0.0 { x } else { alpha * x },
        EltwiseAlg::Elu => if x > 0.0 { x } else { alpha * (x.exp() - 1.0) },
        EltwiseAlg::Tanh => x.tanh(),
        EltwiseAlg::Logistic => logistic(x),
        EltwiseAlg::Exp => x.exp(),
        EltwiseAlg::Square => x * x,
        EltwiseAlg::Abs => x.abs(),
        EltwiseAlg::Linear => alpha * x + beta,
        EltwiseAlg::Clip => x.max(alpha).min(beta),
        EltwiseAlg::Swish => x * logistic(alpha * x),
        EltwiseAlg::HardSwish => x * (alpha * x + beta).clamp(0.0, 1.0),
        EltwiseAlg::Round => x.round_ties_even(),
        other => panic!("no reference for {other:?}"),
    }
}

/// Element of a broadcast operand of dims `src1` read for flat `ncsp`
/// destination index `flat` of `dst`.
pub fn src1_index(dst: &MemoryDesc, src1: &MemoryDesc, flat: usize) -> usize {
    let (c, s) = (dst.channels(), dst.spatial().max(1));
    let n_i = flat / (c * s);
    let c_i = flat / s % c;
    let s_i = flat % s;
    let (c1, s1) = (src1.channels(), src1.spatial().max(1));
    let n_i = if src1.mb() > 1 { n_i } else { 0 };
    let c_i = if c1 > 1 { c_i } else { 0 };
    let s_i = if s1 > 1 { s_i } else { 0 };
    n_i * c1 * s1 + c_i * s1 + s_i
}

/// Inputs of the reference, mirroring `PpCall`. Binary operands are given
/// as f32 values.
pub struct RefCall<'a> {
    pub bias: Option<&'a [f32]>,
    pub len: usize,
    pub oc_start: usize,
    pub oc_work: usize,
    pub oc_stride: usize,
    pub binary_rhs: &'a [&'a [f32]],
    pub post_ops_data: &'a [&'a [f32]],
    pub sum_src: Option<&'a [f32]>,
}

pub fn reference(conf: &PpKernelConf, chain: &PostOpChain, dst: &mut [f32], call: &RefCall<'_>) {
    let last = chain.len().saturating_sub(1);
    for oc in call.oc_start..call.oc_start + call.oc_work {
        for i in 0..call.len {
            let flat = oc * call.oc_stride + i;
            let mut x = dst[flat];
            if let Some(b) = call.bias {
                x += b[oc];
            }
            let (mut rhs_i, mut aux_i) = (0, 0);
            for (pos, entry) in chain.iter().enumerate() {
                match entry {
                    PostOp::Sum { scale, zero_point } => {
                        let prev = call.sum_src.expect("sum source")[flat];
                        x = (prev - *zero_point as f32).mul_add(*scale, x);
                    }
                    PostOp::Eltwise(p) => x = eltwise(p.alg, x, p.alpha, p.beta),
                    PostOp::Binary(b) => {
                        let v = call.binary_rhs[rhs_i][src1_index(&conf.dst_desc, &b.src1_desc, flat)];
                        rhs_i += 1;
                        x = binary(b.alg, x, v);
                    }
                    PostOp::Prelu(p) => {
                        let w = p.weights_desc(&conf.dst_desc);
                        let v = call.binary_rhs[rhs_i][src1_index(&conf.dst_desc, &w, flat)];
                        rhs_i += 1;
                        x = x.max(0.0) + x.min(0.0) * v;
                    }
                    PostOp::Depthwise(p) => {
                        let buf = call.post_ops_data[aux_i];
                        aux_i += 1;
                        let w = buf[oc];
                        x = match p.alg {
                            DepthwiseAlg::ScaleShift => x.mul_add(w, buf[p.bias_offset + oc]),
                            DepthwiseAlg::Prelu => if x > 0.0 { x } else { x * w },
                        };
                    }
                    PostOp::Quantization(q) => {
                        let buf = call.post_ops_data[aux_i];
                        aux_i += 1;
                        let field = |f: QuantField| {
                            let at = q.offset(f) + if q.is_per_channel(f) { oc } else { 0 };
                            buf[at]
                        };
                        let (lo, hi) = (field(QuantField::CropLow), field(QuantField::CropHigh));
                        x = if x > lo { x } else { lo };
                        x = if x < hi { x } else { hi };
                        x = x.mul_add(field(QuantField::InputScale), field(QuantField::InputShift));
                        if do_rounding(q, conf.dst_dt, pos == last) {
                            x = x.round_ties_even();
                        }
                        if q.is_dequantize() {
                            x = x.mul_add(field(QuantField::OutputScale), field(QuantField::OutputShift));
                        }
                    }
                }
            }
            dst[flat] = x;
        }
    }
}

pub fn binary(alg: BinaryAlg, a: f32, b: f32) -> f32 {
    let flag = |c: bool| if c { 1.0 } else { 0.0 };
    match alg {
        BinaryAlg::Add => a + b,
        BinaryAlg::Sub => a - b,
        BinaryAlg::Mul => a * b,
        BinaryAlg::Div => a / b,
        BinaryAlg::Max => if a > b { a } else { b },
        BinaryAlg::Min => if a < b { a } else { b },
        BinaryAlg::Ge => flag(a >= b),
        BinaryAlg::Gt => flag(a > b),
        BinaryAlg::Le => flag(a <= b),
        BinaryAlg::Lt => flag(a < b),
        BinaryAlg::Eq => flag(a == b),
        BinaryAlg::Ne => flag(a != b),
    }
}

pub fn assert_close(got: &[f32], want: &[f32], tol: f32) {
    assert_eq!(got.len(), want.len());
    for (i, (g, w)) in got.iter().zip(want).enumerate() {
        let err = (g - w).abs();
        assert!(
            err <= tol * w.abs().max(1.0),
            "element {i}: got {g}, want {w} (err {err})"
        );
    }
}
