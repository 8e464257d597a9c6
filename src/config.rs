//! Environment-driven configuration.
//!
//! Read once per process. `GLLM_POSTOPS_MAX_ISA` caps the ISA tier reported
//! by the CPU probe (useful to exercise narrower code paths on wide hardware)
//! and `GLLM_POSTOPS_STACK_BYTES` sizes the interpreter stack.

use std::sync::OnceLock;

use crate::dispatch::CpuIsa;

pub const DEFAULT_STACK_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostOpsConfig {
    /// Highest tier the dispatcher may select, `None` for no cap.
    pub max_isa: Option<CpuIsa>,
    /// Private stack size of each kernel invocation.
    pub stack_bytes: usize,
}

impl Default for PostOpsConfig {
    fn default() -> Self {
        PostOpsConfig {
            max_isa: None,
            stack_bytes: DEFAULT_STACK_BYTES,
        }
    }
}

impl PostOpsConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unparsable values are ignored with
    /// a warning.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = PostOpsConfig::default();
        if let Some(raw) = lookup("GLLM_POSTOPS_MAX_ISA") {
            match raw.trim().parse::<CpuIsa>() {
                Ok(isa) => cfg.max_isa = Some(isa),
                Err(err) => log::warn!("ignoring GLLM_POSTOPS_MAX_ISA={raw:?}: {err}"),
            }
        }
        if let Some(raw) = lookup("GLLM_POSTOPS_STACK_BYTES") {
            match raw.trim().parse::<usize>() {
                Ok(bytes) if bytes >= 4096 => cfg.stack_bytes = bytes,
                _ => log::warn!("ignoring GLLM_POSTOPS_STACK_BYTES={raw:?}: need an integer >= 4096"),
            }
        }
        cfg
    }
}

static CONFIG: OnceLock<PostOpsConfig> = OnceLock::new();

/// Process-wide configuration, read from the environment on first use.
pub fn config() -> &'static PostOpsConfig {
    CONFIG.get_or_init(PostOpsConfig::from_env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_env() {
        let cfg = PostOpsConfig::from_lookup(lookup(&[]));
        assert_eq!(cfg, PostOpsConfig::default());
    }

    #[test]
    fn test_max_isa_override() {
        let cfg = PostOpsConfig::from_lookup(lookup(&[("GLLM_POSTOPS_MAX_ISA", "avx2")]));
        assert_eq!(cfg.max_isa, Some(CpuIsa::Avx2));
    }

    #[test]
    fn test_bad_values_are_ignored() {
        let cfg = PostOpsConfig::from_lookup(lookup(&[
            ("GLLM_POSTOPS_MAX_ISA", "pentium"),
            ("GLLM_POSTOPS_STACK_BYTES", "12"),
        ]));
        assert_eq!(cfg.max_isa, None);
        assert_eq!(cfg.stack_bytes, DEFAULT_STACK_BYTES);
    }
}
