//! ISA/width dispatcher for the post-ops injector.
//!
//! Each register width has a fixed tier priority list. An explicitly
//! requested tier wins when it is in the list and usable; otherwise the first
//! usable tier of the list is taken.

use super::postops::{PostOpsInjector, PostOpsStaticParams};
use crate::codegen::VecAsm;
use crate::dispatch::{cpu_caps, CpuCaps, CpuIsa, IsaVariant, VecWidth};
use crate::post_ops::PostOpChain;

const ZMM_PRIORITY: &[CpuIsa] = &[
    CpuIsa::Avx512CoreFp16,
    CpuIsa::Avx512CoreBf16,
    CpuIsa::Avx512Core,
];

const YMM_PRIORITY: &[CpuIsa] = &[
    CpuIsa::Avx512CoreFp16,
    CpuIsa::Avx512Core,
    CpuIsa::Avx2Vnni2,
    CpuIsa::Avx2,
    CpuIsa::Avx,
];

const XMM_PRIORITY: &[CpuIsa] = &[
    CpuIsa::Avx512CoreFp16,
    CpuIsa::Avx512Core,
    CpuIsa::Avx2Vnni2,
    CpuIsa::Avx2,
    CpuIsa::Avx,
    CpuIsa::Sse41,
];

pub fn priority_list(width: VecWidth) -> &'static [CpuIsa] {
    match width {
        VecWidth::Zmm => ZMM_PRIORITY,
        VecWidth::Ymm => YMM_PRIORITY,
        VecWidth::Xmm => XMM_PRIORITY,
    }
}

/// Tier to instantiate for `requested` at `width` on a CPU with `caps`.
pub fn select_isa(caps: &CpuCaps, requested: CpuIsa, width: VecWidth) -> Option<CpuIsa> {
    let list = priority_list(width);
    if list.contains(&requested) && caps.may_use(requested) {
        return Some(requested);
    }
    list.iter().copied().find(|isa| caps.may_use(*isa))
}

/// Build an injector at the host's width, or `None` when no tier of the
/// priority list runs here.
pub fn create<E: VecAsm>(
    asm: &mut E,
    requested: CpuIsa,
    chain: PostOpChain,
    sp: PostOpsStaticParams,
) -> Option<PostOpsInjector<E>> {
    create_with_caps(cpu_caps(), asm, requested, chain, sp)
}

pub fn create_with_caps<E: VecAsm>(
    caps: &CpuCaps,
    asm: &mut E,
    requested: CpuIsa,
    chain: PostOpChain,
    sp: PostOpsStaticParams,
) -> Option<PostOpsInjector<E>> {
    let width = asm.width();
    let Some(isa) = select_isa(caps, requested, width) else {
        log::warn!(
            "post-ops injector: no usable {width:?} tier on {caps} (requested {requested}), fallback: reference path"
        );
        return None;
    };
    if isa != requested {
        log::debug!("post-ops injector: {requested} not usable at {width:?}, using {isa}");
    }
    Some(PostOpsInjector::new(asm, IsaVariant::new(isa, width), chain, sp))
}
