//! Fused epilogue kernels built on the post-ops injector.

pub mod pp_kernel;

pub use pp_kernel::{BinaryOperand, PpCall, PpKernel, PpKernelConf, RegisterPlan, ACCEPTED_KINDS};
