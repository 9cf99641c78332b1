//! Seeded, cached dropout patterns.
//!
//! A dropout node draws its keep/drop pattern once and reuses it until it is
//! explicitly reset, so that the paired gradient node sees exactly the pattern
//! the forward pass applied.
//!
//! On the CPU tiers the pattern is a boolean [`Mask`]: a `StdRng` seeded with
//! the node's seed produces one `uniform(0, 1)` draw per element in row-major
//! order, and an element is kept when its draw is `>= 1 - keep_prob`.
//!
//! On an accelerator the kernel owns the randomness; the cell only records the
//! seed the kernel was launched with, and the gradient kernel is launched with
//! the same seed to regenerate the same pattern.
//!
//! # Generations
//!
//! [`MaskCell::reset`] drops the cached pattern and advances a generation
//! counter. Generation 0 draws from the node's seed itself; later generations
//! draw from [`generation_seed`], so a reset yields a fresh pattern while the
//! whole sequence stays reproducible from the construction-time seed.

use crate::error::{OpError, PatternSite, Result};
use crate::graph::NodeId;
use crate::tensors::{Tensor, TensorFloat, element_count};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Boolean keep/drop pattern; `true` keeps the element.
pub type Mask = Tensor<bool>;

/// Draws the mask for `shape` from a `StdRng` seeded with `seed`.
///
/// Deterministic: the same `(shape, keep_prob, seed)` always yields the same mask.
#[must_use]
pub fn generate_mask(shape: &[usize], keep_prob: TensorFloat, seed: u64) -> Mask {
    let threshold = 1.0 - f64::from(keep_prob);
    let mut rng = StdRng::seed_from_u64(seed);
    let data = (0..element_count(shape))
        .map(|_| rng.random::<f64>() >= threshold)
        .collect();
    Tensor::new(shape.to_vec(), data)
}

/// Seed used for the `generation`-th pattern of a node seeded with `seed`.
///
/// Generation 0 uses `seed` unchanged.
#[must_use]
pub const fn generation_seed(seed: u64, generation: u64) -> u64 {
    if generation == 0 {
        return seed;
    }
    splitmix64(seed ^ generation.wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

const fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// A drawn pattern, wherever it lives.
#[derive(Debug, Clone)]
pub enum Pattern {
    /// Host mask shared with the gradient node.
    Host(Arc<Mask>),
    /// The accelerator kernel was launched with this seed.
    Accelerator {
        /// Seed handed to the forward kernel.
        seed: u64,
    },
}

impl Pattern {
    const fn site(&self) -> PatternSite {
        match self {
            Self::Host(_) => PatternSite::Host,
            Self::Accelerator { .. } => PatternSite::Accelerator,
        }
    }
}

#[derive(Debug, Default)]
struct MaskState {
    generation: u64,
    pattern: Option<Pattern>,
}

/// Per-node pattern cache.
///
/// Exactly one thread drives a node's forward-then-backward sequence; the
/// mutex is never contended and exists so nodes can be shared across threads.
#[derive(Debug, Default)]
pub struct MaskCell {
    state: Mutex<MaskState>,
}

impl MaskCell {
    /// An empty cell at generation 0.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MaskState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the cached host mask, drawing it first if the cell is empty.
    ///
    /// # Errors
    /// - [`OpError::ShapeMismatch`] if a cached mask has a different shape
    /// - [`OpError::MaskLocation`] if the pattern was drawn by an accelerator
    pub fn host_mask_or_init(
        &self,
        node: NodeId,
        shape: &[usize],
        keep_prob: TensorFloat,
        seed: u64,
    ) -> Result<Arc<Mask>> {
        let mut state = self.lock();
        match &state.pattern {
            Some(Pattern::Host(mask)) => {
                if mask.shape() != shape {
                    return Err(OpError::ShapeMismatch {
                        op: "Dropout",
                        expected: mask.shape.clone(),
                        actual: shape.to_vec(),
                    });
                }
                Ok(Arc::clone(mask))
            }
            Some(other) => Err(OpError::MaskLocation {
                node,
                cached: other.site(),
                requested: PatternSite::Host,
            }),
            None => {
                let mask = Arc::new(generate_mask(
                    shape,
                    keep_prob,
                    generation_seed(seed, state.generation),
                ));
                tracing::debug!(
                    %node,
                    generation = state.generation,
                    elements = mask.len(),
                    kept = mask.data.iter().filter(|&&k| k).count(),
                    "drew dropout mask"
                );
                state.pattern = Some(Pattern::Host(Arc::clone(&mask)));
                Ok(mask)
            }
        }
    }

    /// Returns the seed to launch the forward kernel with, recording it if the
    /// cell is empty.
    ///
    /// # Errors
    /// [`OpError::MaskLocation`] if a host mask is already cached.
    pub fn accelerator_seed_or_init(&self, node: NodeId, seed: u64) -> Result<u64> {
        let mut state = self.lock();
        match &state.pattern {
            Some(Pattern::Accelerator { seed }) => Ok(*seed),
            Some(other) => Err(OpError::MaskLocation {
                node,
                cached: other.site(),
                requested: PatternSite::Accelerator,
            }),
            None => {
                let seed = generation_seed(seed, state.generation);
                tracing::debug!(%node, generation = state.generation, seed, "recorded accelerator dropout seed");
                state.pattern = Some(Pattern::Accelerator { seed });
                Ok(seed)
            }
        }
    }

    /// The cached host mask, for a gradient node.
    ///
    /// # Errors
    /// - [`OpError::MissingState`] if nothing has been drawn yet
    /// - [`OpError::MaskLocation`] if the pattern lives on an accelerator
    pub fn host_mask(&self, node: NodeId) -> Result<Arc<Mask>> {
        match &self.lock().pattern {
            Some(Pattern::Host(mask)) => Ok(Arc::clone(mask)),
            Some(other) => Err(OpError::MaskLocation {
                node,
                cached: other.site(),
                requested: PatternSite::Host,
            }),
            None => Err(OpError::MissingState {
                op: "DropoutGradient",
                node,
            }),
        }
    }

    /// The seed the forward kernel ran with, for a gradient node.
    ///
    /// # Errors
    /// - [`OpError::MissingState`] if the forward kernel has not been launched
    /// - [`OpError::MaskLocation`] if the pattern is a host mask
    pub fn accelerator_seed(&self, node: NodeId) -> Result<u64> {
        match &self.lock().pattern {
            Some(Pattern::Accelerator { seed }) => Ok(*seed),
            Some(other) => Err(OpError::MaskLocation {
                node,
                cached: other.site(),
                requested: PatternSite::Accelerator,
            }),
            None => Err(OpError::MissingState {
                op: "DropoutGradient",
                node,
            }),
        }
    }

    /// A snapshot of the cached pattern, if any.
    #[must_use]
    pub fn current(&self) -> Option<Pattern> {
        self.lock().pattern.clone()
    }

    /// Current generation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Drops the cached pattern and advances the generation.
    ///
    /// A reset on an empty cell is a no-op, so resetting before every run
    /// does not skip generations that were never drawn.
    pub fn reset(&self) {
        let mut state = self.lock();
        if state.pattern.take().is_some() {
            state.generation += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_mask() {
        let a = generate_mask(&[4, 8], 0.5, 7);
        let b = generate_mask(&[4, 8], 0.5, 7);
        assert_eq!(a, b);
        assert_eq!(a.shape, vec![4, 8]);
    }

    #[test]
    fn keep_probability_one_keeps_everything() {
        let mask = generate_mask(&[257], 1.0, 3);
        assert!(mask.data.iter().all(|&k| k));
    }

    #[test]
    fn kept_fraction_tracks_keep_probability() {
        let mask = generate_mask(&[10_000], 0.3, 11);
        let kept = mask.data.iter().filter(|&&k| k).count();
        assert!((2_500..3_500).contains(&kept), "kept {kept}");
    }

    #[test]
    fn generation_zero_is_the_seed() {
        assert_eq!(generation_seed(42, 0), 42);
        assert_ne!(generation_seed(42, 1), 42);
        assert_ne!(generation_seed(42, 1), generation_seed(42, 2));
    }

    #[test]
    fn cell_caches_until_reset() {
        let node = NodeId::next();
        let cell = MaskCell::new();
        let first = cell.host_mask_or_init(node, &[64], 0.5, 9).unwrap();
        let again = cell.host_mask_or_init(node, &[64], 0.5, 9).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert!(Arc::ptr_eq(&first, &cell.host_mask(node).unwrap()));

        cell.reset();
        assert_eq!(cell.generation(), 1);
        assert!(matches!(cell.host_mask(node), Err(OpError::MissingState { .. })));

        let fresh = cell.host_mask_or_init(node, &[64], 0.5, 9).unwrap();
        assert_eq!(*fresh, generate_mask(&[64], 0.5, generation_seed(9, 1)));
    }

    #[test]
    fn reset_of_empty_cell_keeps_generation() {
        let cell = MaskCell::new();
        cell.reset();
        cell.reset();
        assert_eq!(cell.generation(), 0);
    }

    #[test]
    fn sites_do_not_mix() {
        let node = NodeId::next();
        let cell = MaskCell::new();
        assert_eq!(cell.accelerator_seed_or_init(node, 5).unwrap(), 5);
        assert!(matches!(
            cell.host_mask_or_init(node, &[2], 0.5, 5),
            Err(OpError::MaskLocation { cached: PatternSite::Accelerator, .. })
        ));
        assert!(matches!(
            cell.host_mask(node),
            Err(OpError::MaskLocation { requested: PatternSite::Host, .. })
        ));
        assert_eq!(cell.accelerator_seed(node).unwrap(), 5);
    }

    #[test]
    fn cached_mask_rejects_new_shape() {
        let node = NodeId::next();
        let cell = MaskCell::new();
        cell.host_mask_or_init(node, &[3], 0.5, 1).unwrap();
        assert!(matches!(
            cell.host_mask_or_init(node, &[4], 0.5, 1),
            Err(OpError::ShapeMismatch { .. })
        ));
    }
}
