//! ISA model and the process-wide CPU capability cache.
//!
//! `cpu_caps()` probes once and applies the `GLLM_POSTOPS_MAX_ISA` cap from
//! [`crate::config`]. Everything that needs to be testable against a
//! different CPU takes a `&CpuCaps` instead of calling `may_use` directly.

pub mod hw_info;
pub mod isa;

pub use hw_info::CpuCaps;
pub use isa::{is_superset, CpuIsa, IsaVariant, VecWidth};

use std::sync::OnceLock;

static CAPS: OnceLock<CpuCaps> = OnceLock::new();

/// Capabilities of the running CPU (detected once, cached for process lifetime).
pub fn cpu_caps() -> &'static CpuCaps {
    CAPS.get_or_init(|| {
        let detected = CpuCaps::detect();
        let caps = match crate::config::config().max_isa {
            Some(max) => detected.capped(max),
            None => detected,
        };
        log::debug!("cpu caps: {caps} (detected {detected})");
        caps
    })
}

/// The running CPU supports `isa`.
pub fn may_use(isa: CpuIsa) -> bool {
    cpu_caps().may_use(isa)
}
