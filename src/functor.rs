//! The functor seam
//!
//! The engine never touches a pair functor's internals; it drives the entry
//! points declared here. A functor receives either whole particles (AoS) or
//! column views (SoA), with the Newton-3 flag telling it whether to write the
//! reaction force — a functor declaring `!allows_newton3()` must never see
//! `newton3 = true` and vice versa; the selector and the containers enforce
//! this before any traversal runs.
//!
//! ## Global scalar discipline
//!
//! Functors that accumulate globals (potential energy, virial) do so into
//! [`ThreadScalars`]: one cache-line-sized bucket per worker thread, reduced
//! in `end_traversal`. In non-Newton-3 mode the engine has visited each pair
//! twice, so `end_traversal(false)` must halve the reduced totals. Accessing
//! totals before post-processing, or post-processing twice without an
//! intervening `init_traversal`, is a [`FunctorError::PostProcessingOrder`].

use std::ops::Range;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::particle::{Attr, Particle};
use crate::soa::{SoaBuffer, SoaView};
use crate::{Real, V3};

/// Memory layout a traversal drives the functor in.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataLayout {
    /// Array of structures: whole particles.
    #[serde(rename = "aos")]
    Aos,
    /// Structure of arrays: one column per attribute.
    #[serde(rename = "soa")]
    Soa,
    /// Device-resident columns. Recognized but never applicable (no device).
    #[serde(rename = "cuda")]
    Cuda,
}

impl DataLayout {
    /// Stable lowercase tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            DataLayout::Aos => "aos",
            DataLayout::Soa => "soa",
            DataLayout::Cuda => "cuda",
        }
    }
}

/// Errors surfaced by functor post-processing accessors.
#[derive(Debug, thiserror::Error)]
pub enum FunctorError {
    /// `end_traversal` was called twice without reset, or an accessor ran
    /// before post-processing.
    #[error("post-processing order violated: {0}")]
    PostProcessingOrder(&'static str),
}

/// Reduced global scalars of one traversal.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Scalars {
    /// Accumulated potential energy.
    pub potential: Real,
    /// Accumulated virial.
    pub virial: Real,
}

/// The capability set the engine drives.
///
/// `aos`/`soa_*` are called from inside parallel color phases and therefore
/// take `&self`; functors keep mutable traversal state in [`ThreadScalars`]
/// or equivalent interior-mutable storage. `init_traversal`/`end_traversal`
/// run on the driver thread with exclusive access.
pub trait Functor<P: Particle>: Send + Sync {
    /// Process one particle pair. Updates `i`'s force, and `j`'s when
    /// `newton3` is set.
    fn aos(&self, i: &mut P, j: &mut P, newton3: bool);

    /// All pairs within one buffer.
    fn soa_single(&self, soa: SoaView<'_>, newton3: bool);

    /// All cross pairs between two buffers. Without Newton-3 only the first
    /// buffer's forces are written; the engine calls the swapped orientation
    /// separately. `r_hat`, when present, is the unit vector between the two
    /// owning cells' centers, passed through unchanged.
    fn soa_pair(&self, a: SoaView<'_>, b: SoaView<'_>, newton3: bool, r_hat: Option<V3>);

    /// Rows `rows` of a Verlet-list buffer: for each row `i` in the range,
    /// all partners `neighbors[i]`.
    fn soa_verlet(&self, soa: &mut SoaBuffer, neighbors: &[Vec<u32>], rows: Range<usize>, newton3: bool);

    /// Reset per-traversal state (thread buckets, post-processing flag).
    fn init_traversal(&mut self) {}

    /// Reduce per-thread accumulators; must halve globals when `!newton3`.
    fn end_traversal(&mut self, newton3: bool) {
        let _ = newton3;
    }

    /// Whether the functor supports Newton-3 calls.
    fn allows_newton3(&self) -> bool {
        true
    }

    /// Whether the functor supports non-Newton-3 calls.
    fn allows_non_newton3(&self) -> bool {
        true
    }

    /// Whether the auto-tuner should sample this functor.
    fn is_relevant_for_tuning(&self) -> bool {
        true
    }

    /// Columns the SoA loader must gather.
    fn needed_attrs(&self) -> &'static [Attr];

    /// Columns the SoA extractor must scatter back.
    fn computed_attrs(&self) -> &'static [Attr];
}

// ============================================================================
// Per-thread scalar buckets
// ============================================================================

/// One bucket, padded to a cache line so neighboring workers do not share one.
#[derive(Default)]
#[repr(align(64))]
struct Bucket(Mutex<Scalars>);

/// Thread-indexed accumulator array for global scalars.
///
/// Sized to the rayon pool plus one spill bucket for calls arriving from
/// outside the pool. Buckets are `Mutex`-wrapped for interior mutability, but
/// each is only ever touched by its own thread, so the locks stay uncontended.
pub struct ThreadScalars {
    buckets: Vec<Bucket>,
}

impl std::fmt::Debug for ThreadScalars {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadScalars").field("buckets", &self.buckets.len()).finish()
    }
}

impl Default for ThreadScalars {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadScalars {
    /// Buckets for the current rayon pool.
    pub fn new() -> Self {
        let n = rayon::current_num_threads().max(1) + 1;
        Self { buckets: (0..n).map(|_| Bucket::default()).collect() }
    }

    fn bucket(&self) -> &Bucket {
        let idx = rayon::current_thread_index().unwrap_or(self.buckets.len() - 1);
        &self.buckets[idx.min(self.buckets.len() - 1)]
    }

    /// Accumulate into the calling thread's bucket.
    pub fn add(&self, potential: Real, virial: Real) {
        let mut s = self.bucket().0.lock().expect("scalar bucket poisoned");
        s.potential += potential;
        s.virial += virial;
    }

    /// Zero all buckets.
    pub fn reset(&self) {
        for b in &self.buckets {
            *b.0.lock().expect("scalar bucket poisoned") = Scalars::default();
        }
    }

    /// Sum all buckets.
    pub fn reduce(&self) -> Scalars {
        let mut out = Scalars::default();
        for b in &self.buckets {
            let s = b.0.lock().expect("scalar bucket poisoned");
            out.potential += s.potential;
            out.virial += s.virial;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::prelude::*;

    #[test]
    fn buckets_reduce_across_threads() {
        let acc = ThreadScalars::new();
        (0..1000).into_par_iter().for_each(|_| acc.add(1.0, 2.0));
        let s = acc.reduce();
        assert!((s.potential - 1000.0).abs() < 1e-9);
        assert!((s.virial - 2000.0).abs() < 1e-9);
        acc.reset();
        assert_eq!(acc.reduce(), Scalars::default());
    }
}
