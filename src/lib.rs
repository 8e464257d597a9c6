//! gllm-postops: fused post-op epilogues for vectorized CPU kernels.
//!
//! A post-op chain (sum, eltwise, binary, prelu, depthwise, quantization) is
//! validated per ISA and destination layout, then emitted in-register on top
//! of a primitive's accumulator registers:
//! - **Validity**: [`post_ops::post_ops_ok`] answers with a plain `bool`
//! - **Injection**: [`injectors::PostOpsInjector`] wires one generator per
//!   entry and emits the chain over any set of vector registers
//! - **Dispatch**: [`injectors::create`] picks the ISA tier for a register
//!   width from a fixed priority list
//! - **Epilogue**: [`kernels::PpKernel`] is a complete bias + post-ops kernel
//!   with tail masking
//!
//! # Quick Start
//!
//! ```ignore
//! use gllm_postops::{PostOpChain, PpKernel, PpKernelConf, PpCall};
//!
//! let chain = PostOpChain::builder().eltwise(EltwiseAlg::Relu, 0.0, 0.0).build();
//! if let Some(kernel) = PpKernel::create(conf, chain)? {
//!     kernel.execute(call)?;
//! }
//! ```

pub mod codegen;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod injectors;
pub mod kernels;
pub mod post_ops;
pub mod types;

pub use config::{config, PostOpsConfig};
pub use dispatch::{cpu_caps, is_superset, may_use, CpuCaps, CpuIsa, IsaVariant, VecWidth};
pub use error::{CodegenError, ExecError, PostOpsError, PostOpsResult};
pub use injectors::{PostOpsDynamicParams, PostOpsInjector, PostOpsStaticParams, VmmIndexSet};
pub use kernels::{BinaryOperand, PpCall, PpKernel, PpKernelConf};
pub use post_ops::{
    is_chain_supported, post_ops_ok, BinaryAlg, DepthwiseAlg, EltwiseAlg, PostOp, PostOpChain,
    PostOpKind, PostOpsBuilder, PostOpsOkArgs, QuantizationAlg, QuantizationParams, SumPolicy,
};
pub use types::{DataType, FormatKind, MemoryDesc};
