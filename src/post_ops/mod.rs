//! Post-op chains: entries, the immutable chain and its validity check.

pub mod chain;
pub mod entry;
pub mod validity;

pub use chain::{PostOpChain, PostOpsBuilder};
pub use entry::{
    BinaryAlg, BinaryParams, DepthwiseAlg, DepthwiseParams, EltwiseAlg, EltwiseParams, PostOp,
    PostOpKind, PreluParams, QuantField, QuantizationAlg, QuantizationParams, PARAM_ALIGN,
};
pub use validity::{is_chain_supported, post_ops_ok, PostOpsOkArgs, SumPolicy};
