//! Immutable post-op chains and their builder.

use std::ops::Index;
use std::sync::Arc;

use super::entry::*;
use crate::types::MemoryDesc;

/// An ordered, immutable sequence of post-ops. Cloning shares the entries.
#[derive(Debug, Clone, PartialEq)]
pub struct PostOpChain {
    entries: Arc<[PostOp]>,
}

impl PostOpChain {
    pub fn new(entries: Vec<PostOp>) -> Self {
        PostOpChain {
            entries: entries.into(),
        }
    }

    pub fn builder() -> PostOpsBuilder {
        PostOpsBuilder::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[PostOp] {
        &self.entries
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PostOp> {
        self.entries.iter()
    }

    /// Position of the first entry of `kind`.
    pub fn find(&self, kind: PostOpKind) -> Option<usize> {
        self.entries.iter().position(|e| e.kind() == kind)
    }

    pub fn contains(&self, kind: PostOpKind) -> bool {
        self.find(kind).is_some()
    }

    pub fn count(&self, kind: PostOpKind) -> usize {
        self.entries.iter().filter(|e| e.kind() == kind).count()
    }

    pub fn only_eltwise(&self) -> bool {
        self.entries.iter().all(|e| e.kind() == PostOpKind::Eltwise)
    }

    /// Entries that read a second operand through the rhs pointer vector.
    pub fn binary_like_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_like_binary()).count()
    }

    /// Pointer slots the auxiliary table must provide.
    pub fn aux_pointer_count(&self) -> usize {
        self.entries.iter().filter(|e| e.uses_aux_table()).count()
    }

    /// Scale and zero point of the first sum entry.
    pub fn first_sum(&self) -> Option<(f32, i32)> {
        self.entries.iter().find_map(|e| match e {
            PostOp::Sum { scale, zero_point } => Some((*scale, *zero_point)),
            _ => None,
        })
    }
}

impl Default for PostOpChain {
    fn default() -> Self {
        PostOpChain::new(Vec::new())
    }
}

impl Index<usize> for PostOpChain {
    type Output = PostOp;

    fn index(&self, idx: usize) -> &PostOp {
        &self.entries[idx]
    }
}

impl<'a> IntoIterator for &'a PostOpChain {
    type Item = &'a PostOp;
    type IntoIter = std::slice::Iter<'a, PostOp>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Appends entries in execution order.
#[derive(Debug, Clone, Default)]
pub struct PostOpsBuilder {
    entries: Vec<PostOp>,
}

impl PostOpsBuilder {
    pub fn sum(mut self, scale: f32, zero_point: i32) -> Self {
        self.entries.push(PostOp::Sum { scale, zero_point });
        self
    }

    pub fn eltwise(mut self, alg: EltwiseAlg, alpha: f32, beta: f32) -> Self {
        self.entries
            .push(PostOp::Eltwise(EltwiseParams { alg, alpha, beta }));
        self
    }

    pub fn binary(mut self, alg: BinaryAlg, src1_desc: MemoryDesc) -> Self {
        self.entries
            .push(PostOp::Binary(BinaryParams { alg, src1_desc }));
        self
    }

    pub fn prelu(mut self, mask: u32) -> Self {
        self.entries.push(PostOp::Prelu(PreluParams { mask }));
        self
    }

    pub fn depthwise(mut self, alg: DepthwiseAlg, channels: usize) -> Self {
        self.entries
            .push(PostOp::Depthwise(DepthwiseParams::new(alg, channels)));
        self
    }

    pub fn quantization(mut self, params: QuantizationParams) -> Self {
        self.entries.push(PostOp::Quantization(params));
        self
    }

    pub fn push(mut self, entry: PostOp) -> Self {
        self.entries.push(entry);
        self
    }

    pub fn build(self) -> PostOpChain {
        PostOpChain::new(self.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_preserves_order() {
        let chain = PostOpChain::builder()
            .sum(1.0, 0)
            .eltwise(EltwiseAlg::Relu, 0.0, 0.0)
            .depthwise(DepthwiseAlg::ScaleShift, 8)
            .quantization(QuantizationParams::new(QuantizationAlg::Quantize, [false; 6], 8))
            .build();
        let kinds: Vec<_> = chain.iter().map(PostOp::kind).collect();
        assert_eq!(
            kinds,
            vec![
                PostOpKind::Sum,
                PostOpKind::Eltwise,
                PostOpKind::Depthwise,
                PostOpKind::Quantization
            ]
        );
        assert_eq!(chain.aux_pointer_count(), 2);
        assert_eq!(chain.find(PostOpKind::Depthwise), Some(2));
        assert_eq!(chain.first_sum(), Some((1.0, 0)));
        assert!(!chain.only_eltwise());
    }

    #[test]
    fn test_clone_shares_entries() {
        let chain = PostOpChain::builder().prelu(0).build();
        let other = chain.clone();
        assert!(Arc::ptr_eq(&chain.entries, &other.entries));
        assert_eq!(other.binary_like_count(), 1);
    }

    #[test]
    fn test_empty_chain() {
        let chain = PostOpChain::default();
        assert!(chain.is_empty());
        assert!(chain.only_eltwise());
        assert_eq!(chain.first_sum(), None);
    }
}
