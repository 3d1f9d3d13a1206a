//! Memory combiners: typed strategies for folding a memory vector into the
//! pooled self-attention context.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::IndexError;

use super::IndexResult;

/// Folds `memory` into `hidden`, returning a vector of `hidden.len()`.
///
/// Memory entries beyond `hidden.len()` are ignored; missing ones count as zero.
pub trait MemoryCombiner: Send + Sync + fmt::Debug {
    /// Name the combiner is registered under.
    fn name(&self) -> &str;

    fn combine(&self, hidden: &[f64], memory: &[f64]) -> Vec<f64>;
}

/// Element-wise sum.
#[derive(Debug, Default, Clone, Copy)]
pub struct Additive;

impl MemoryCombiner for Additive {
    fn name(&self) -> &str {
        "additive"
    }

    fn combine(&self, hidden: &[f64], memory: &[f64]) -> Vec<f64> {
        hidden
            .iter()
            .enumerate()
            .map(|(i, h)| h + memory.get(i).copied().unwrap_or(0.0))
            .collect()
    }
}

/// Reads consecutive pairs as complex numbers `(re, im)`, sums hidden and
/// memory, and emits each result as `(magnitude, phase)`.
///
/// A trailing odd element is summed directly.
#[derive(Debug, Default, Clone, Copy)]
pub struct PhaseMagnitude;

impl MemoryCombiner for PhaseMagnitude {
    fn name(&self) -> &str {
        "phase-magnitude"
    }

    fn combine(&self, hidden: &[f64], memory: &[f64]) -> Vec<f64> {
        let m = |i: usize| memory.get(i).copied().unwrap_or(0.0);
        let mut out = Vec::with_capacity(hidden.len());
        let mut i = 0;
        while i + 1 < hidden.len() {
            let re = hidden[i] + m(i);
            let im = hidden[i + 1] + m(i + 1);
            out.push(re.hypot(im));
            out.push(im.atan2(re));
            i += 2;
        }
        if i < hidden.len() {
            out.push(hidden[i] + m(i));
        }
        out
    }
}

/// Combiners addressable by name.
#[derive(Debug, Default)]
pub struct CombinerRegistry {
    combiners: Vec<Arc<dyn MemoryCombiner>>,
    name_index: HashMap<String, usize>,
}

impl CombinerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in combiners.
    pub fn builtin() -> Self {
        let mut reg = Self::new();
        for c in [
            Arc::new(Additive) as Arc<dyn MemoryCombiner>,
            Arc::new(PhaseMagnitude),
        ] {
            let name = c.name().to_string();
            reg.name_index.insert(name, reg.combiners.len());
            reg.combiners.push(c);
        }
        reg
    }

    pub fn register(&mut self, combiner: Arc<dyn MemoryCombiner>) -> IndexResult<()> {
        let name = combiner.name().to_string();
        if self.name_index.contains_key(&name) {
            return Err(IndexError::DuplicateCombiner { name });
        }
        self.name_index.insert(name, self.combiners.len());
        self.combiners.push(combiner);
        Ok(())
    }

    pub fn get(&self, name: &str) -> IndexResult<Arc<dyn MemoryCombiner>> {
        self.name_index
            .get(name)
            .map(|&i| Arc::clone(&self.combiners[i]))
            .ok_or_else(|| IndexError::UnknownCombiner {
                name: name.to_string(),
            })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.combiners.iter().map(|c| c.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn additive_pads_missing_memory() {
        assert_eq!(Additive.combine(&[1.0, 2.0, 3.0], &[0.5]), vec![1.5, 2.0, 3.0]);
    }

    #[test]
    fn phase_magnitude_sums_complex_pairs() {
        let out = PhaseMagnitude.combine(&[1.0, 0.0, 2.0], &[0.0, 1.0, 1.0]);
        assert!((out[0] - 2f64.sqrt()).abs() < 1e-12);
        assert!((out[1] - std::f64::consts::FRAC_PI_4).abs() < 1e-12);
        assert_eq!(out[2], 3.0);
    }

    #[test]
    fn registry_lookup_by_name() {
        let mut reg = CombinerRegistry::builtin();
        assert_eq!(reg.get("phase-magnitude").unwrap().name(), "phase-magnitude");
        assert!(matches!(
            reg.get("eval"),
            Err(IndexError::UnknownCombiner { .. })
        ));
        assert!(matches!(
            reg.register(Arc::new(Additive)),
            Err(IndexError::DuplicateCombiner { .. })
        ));
        assert_eq!(reg.names().collect::<Vec<_>>(), vec!["additive", "phase-magnitude"]);
    }
}
