//! Post-op chain validity per ISA and destination layout.
//!
//! Rejection is an ordinary `false` with the reason logged at debug level;
//! a primitive builder is expected to try another ISA or a reference path.

use super::chain::PostOpChain;
use super::entry::{PostOp, PostOpKind};
use crate::dispatch::CpuIsa;
use crate::injectors::binary::{self, default_strategies, BroadcastSet};
use crate::injectors::eltwise;
use crate::types::{DataType, FormatKind, MemoryDesc};

/// Restrictions a consumer places on `sum` entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SumPolicy {
    pub at_pos_0_only: bool,
    pub requires_scale_one: bool,
    pub requires_zp_zero: bool,
    /// Every sum must repeat the first sum's scale and zero point.
    pub requires_same_params: bool,
}

/// Inputs of [`post_ops_ok`].
#[derive(Debug, Clone)]
pub struct PostOpsOkArgs<'a> {
    pub isa: CpuIsa,
    pub accepted: &'a [PostOpKind],
    pub chain: &'a PostOpChain,
    pub dst_d: Option<&'a MemoryDesc>,
    pub sum: SumPolicy,
    pub enabled_bcast_strategy: BroadcastSet,
}

impl<'a> PostOpsOkArgs<'a> {
    pub fn new(
        isa: CpuIsa,
        accepted: &'a [PostOpKind],
        chain: &'a PostOpChain,
        dst_d: Option<&'a MemoryDesc>,
    ) -> Self {
        PostOpsOkArgs {
            isa,
            accepted,
            chain,
            dst_d,
            sum: SumPolicy::default(),
            enabled_bcast_strategy: default_strategies(),
        }
    }

    pub fn sum_policy(mut self, sum: SumPolicy) -> Self {
        self.sum = sum;
        self
    }

    pub fn strategies(mut self, strategies: BroadcastSet) -> Self {
        self.enabled_bcast_strategy = strategies;
        self
    }
}

fn kind_accepted(accepted: &[PostOpKind], entry: &PostOp) -> bool {
    accepted.iter().any(|&kind| match kind {
        PostOpKind::Binary | PostOpKind::Prelu => entry.is_like_binary(),
        other => entry.kind() == other,
    })
}

/// The chain can be generated on `args.isa` for `args.dst_d`.
pub fn post_ops_ok(args: &PostOpsOkArgs<'_>) -> bool {
    let Some(dst) = args.dst_d else {
        log::debug!("post-ops rejected: no destination descriptor");
        return false;
    };
    if dst.format == FormatKind::Any {
        log::debug!("post-ops rejected: destination format is unspecified");
        return false;
    }
    let canonical = args.chain.first_sum();

    for (pos, entry) in args.chain.iter().enumerate() {
        if !kind_accepted(args.accepted, entry) {
            log::debug!("post-ops rejected: {:?} at {pos} not accepted", entry.kind());
            return false;
        }
        let ok = match entry {
            PostOp::Sum { scale, zero_point } => {
                sum_ok(&args.sum, pos, *scale, *zero_point, canonical)
            }
            PostOp::Eltwise(p) => {
                let ok = eltwise::is_supported(args.isa, p.alg, DataType::F32);
                if !ok {
                    log::debug!("post-ops rejected: eltwise {:?} on {}", p.alg, args.isa);
                }
                ok
            }
            PostOp::Binary(_) | PostOp::Prelu(_) => {
                let ok = entry.src1_desc(dst).is_some_and(|src1| {
                    binary::is_supported(args.isa, &src1, dst, &args.enabled_bcast_strategy)
                });
                if !ok {
                    log::debug!(
                        "post-ops rejected: {:?} operand at {pos} on {} for dst {:?}",
                        entry.kind(),
                        args.isa,
                        dst.dims
                    );
                }
                ok
            }
            PostOp::Depthwise(_) | PostOp::Quantization(_) => true,
        };
        if !ok {
            return false;
        }
    }
    true
}

fn sum_ok(policy: &SumPolicy, pos: usize, scale: f32, zp: i32, canonical: Option<(f32, i32)>) -> bool {
    if policy.at_pos_0_only && pos != 0 {
        log::debug!("post-ops rejected: sum at position {pos}");
        return false;
    }
    if policy.requires_scale_one && scale != 1.0 {
        log::debug!("post-ops rejected: sum scale {scale} != 1");
        return false;
    }
    if policy.requires_zp_zero && zp != 0 {
        log::debug!("post-ops rejected: sum zero point {zp} != 0");
        return false;
    }
    if policy.requires_same_params && canonical.is_some_and(|c| c != (scale, zp)) {
        log::debug!("post-ops rejected: sum ({scale}, {zp}) differs from first sum");
        return false;
    }
    true
}

/// Positional form of [`post_ops_ok`].
pub fn is_chain_supported(
    isa: CpuIsa,
    accepted: &[PostOpKind],
    chain: &PostOpChain,
    dst: &MemoryDesc,
    sum: SumPolicy,
    strategies: &BroadcastSet,
) -> bool {
    post_ops_ok(
        &PostOpsOkArgs::new(isa, accepted, chain, Some(dst))
            .sum_policy(sum)
            .strategies(strategies.clone()),
    )
}
