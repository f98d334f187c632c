//! Traversal schemes over the cell grid
//!
//! A traversal decides *in which order and with which parallel structure* the
//! cell functor visits cells and cell pairs, such that every in-range particle
//! pair is covered exactly once (Newton-3) or once per ordering (without).
//! All linked-cell schemes share a **base step** built from a cell-offset
//! schedule computed once per grid: an offset is retained only if the minimum
//! distance between the two cells' boxes is within the interaction length.
//!
//! Parallel structure is always "colors outside, cells inside": each color is
//! one `par_iter` phase, and the phase boundary is the implicit barrier the
//! ordering guarantees require. Within a phase, same-color base steps touch
//! disjoint cell sets by construction; the per-cell locks below make that
//! disjointness checkable instead of asserted.

use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::cell::ParticleCell;
use crate::cell_functor::CellFunctor;
use crate::functor::DataLayout;
use crate::geometry;
use crate::particle::Particle;
use crate::{Real, V3};

mod c01;
mod c04;
mod c08;
mod c18;
mod sliced;

pub use c01::C01Traversal;
pub use c04::C04Traversal;
pub use c08::C08Traversal;
pub use c18::C18Traversal;
pub use sliced::SlicedTraversal;

/// Canonical traversal tags recognized by the selector.
///
/// The stringified tags are part of the configuration surface; adding new
/// variants is backward-compatible, renaming existing ones is not.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum TraversalKind {
    #[serde(rename = "directSumTraversal")]
    DirectSum,
    #[serde(rename = "c01")]
    C01,
    #[serde(rename = "c04")]
    C04,
    #[serde(rename = "c04SoA")]
    C04Soa,
    #[serde(rename = "c08")]
    C08,
    #[serde(rename = "c18")]
    C18,
    #[serde(rename = "sliced")]
    Sliced,
    #[serde(rename = "verletTraversal")]
    Verlet,
    #[serde(rename = "c01Verlet")]
    C01Verlet,
    #[serde(rename = "c18Verlet")]
    C18Verlet,
    #[serde(rename = "slicedVerlet")]
    SlicedVerlet,
    #[serde(rename = "varVerletTraversalAsBuild")]
    VarVerletAsBuild,
    #[serde(rename = "verletClusters")]
    VerletClusters,
    #[serde(rename = "verletClustersColoring")]
    VerletClustersColoring,
    #[serde(rename = "c01Cuda")]
    C01Cuda,
}

impl TraversalKind {
    /// Stable tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            TraversalKind::DirectSum => "directSumTraversal",
            TraversalKind::C01 => "c01",
            TraversalKind::C04 => "c04",
            TraversalKind::C04Soa => "c04SoA",
            TraversalKind::C08 => "c08",
            TraversalKind::C18 => "c18",
            TraversalKind::Sliced => "sliced",
            TraversalKind::Verlet => "verletTraversal",
            TraversalKind::C01Verlet => "c01Verlet",
            TraversalKind::C18Verlet => "c18Verlet",
            TraversalKind::SlicedVerlet => "slicedVerlet",
            TraversalKind::VarVerletAsBuild => "varVerletTraversalAsBuild",
            TraversalKind::VerletClusters => "verletClusters",
            TraversalKind::VerletClustersColoring => "verletClustersColoring",
            TraversalKind::C01Cuda => "c01Cuda",
        }
    }

    /// Every recognized tag.
    pub fn all() -> &'static [TraversalKind] {
        &[
            TraversalKind::DirectSum,
            TraversalKind::C01,
            TraversalKind::C04,
            TraversalKind::C04Soa,
            TraversalKind::C08,
            TraversalKind::C18,
            TraversalKind::Sliced,
            TraversalKind::Verlet,
            TraversalKind::C01Verlet,
            TraversalKind::C18Verlet,
            TraversalKind::SlicedVerlet,
            TraversalKind::VarVerletAsBuild,
            TraversalKind::VerletClusters,
            TraversalKind::VerletClustersColoring,
            TraversalKind::C01Cuda,
        ]
    }
}

/// Getter surface every cell-pair traversal exposes to the selector layer.
pub trait CellPairTraversal {
    /// Which tag this traversal implements.
    fn traversal_type(&self) -> TraversalKind;
    /// Whether Newton-3 reciprocity is exploited.
    fn use_newton3(&self) -> bool;
    /// Which layout the functor is driven in.
    fn data_layout(&self) -> DataLayout;
}

// ============================================================================
// Cell locks
// ============================================================================

/// Lock one cell. A poisoned lock means a worker panicked mid-write; the
/// grid contents are unspecified then, so this is fatal.
#[inline]
pub(crate) fn lock<C>(cells: &[Mutex<C>], index: usize) -> MutexGuard<'_, C> {
    cells[index].lock().expect("cell lock poisoned")
}

/// Lock two distinct cells, acquiring the lower index first so concurrent
/// pair visits cannot form a circular wait. Guards are returned in argument
/// order.
pub(crate) fn lock_two<'a, C>(
    cells: &'a [Mutex<C>],
    a: usize,
    b: usize,
) -> (MutexGuard<'a, C>, MutexGuard<'a, C>) {
    debug_assert_ne!(a, b, "cell pair lock requires distinct cells");
    if a < b {
        let ga = lock(cells, a);
        let gb = lock(cells, b);
        (ga, gb)
    } else {
        let gb = lock(cells, b);
        let ga = lock(cells, a);
        (ga, gb)
    }
}

// ============================================================================
// Offset schedules
// ============================================================================

/// One retained entry of a base-step schedule: both cells as coordinate
/// offsets from the anchor, plus the unit vector between their centers.
#[derive(Clone, Debug)]
pub(crate) struct BasePair {
    pub first: [isize; 3],
    pub second: [isize; 3],
    pub r_hat: Option<V3>,
}

/// Same entry with the offsets flattened against a concrete grid.
#[derive(Copy, Clone, Debug)]
pub(crate) struct FlatPair {
    pub d1: isize,
    pub d2: isize,
    pub r_hat: Option<V3>,
}

#[inline]
pub(crate) fn flat_delta(off: [isize; 3], dims: [usize; 3]) -> isize {
    off[0] + dims[0] as isize * (off[1] + dims[1] as isize * off[2])
}

pub(crate) fn flatten_pairs(pairs: &[BasePair], dims: [usize; 3]) -> Vec<FlatPair> {
    pairs
        .iter()
        .map(|p| FlatPair {
            d1: flat_delta(p.first, dims),
            d2: flat_delta(p.second, dims),
            r_hat: p.r_hat,
        })
        .collect()
}

#[inline]
pub(crate) fn r_hat_of(off: [isize; 3], cell_len: V3) -> Option<V3> {
    geometry::normalized([
        off[0] as Real * cell_len[0],
        off[1] as Real * cell_len[1],
        off[2] as Real * cell_len[2],
    ])
}

/// Whether two cells separated by `off` can hold interacting particles.
#[inline]
pub(crate) fn offset_in_range(off: [isize; 3], cell_len: V3, interaction_length: Real) -> bool {
    geometry::min_cell_dist2(off, cell_len) <= interaction_length * interaction_length
}

/// The 13 unique unordered cell pairs of the 2x2x2 c08 base step. Every one
/// of the 13 half-space offset classes appears exactly once as the difference
/// `second - first`, so applying the step at every anchor below the far wall
/// covers every adjacent cell pair exactly once.
pub(crate) fn c08_base_pairs(cell_len: V3, interaction_length: Real) -> Vec<BasePair> {
    const RAW: [([isize; 3], [isize; 3]); 13] = [
        ([0, 0, 0], [1, 0, 0]),
        ([0, 0, 0], [0, 1, 0]),
        ([0, 0, 0], [0, 0, 1]),
        ([0, 0, 0], [1, 1, 0]),
        ([0, 0, 0], [1, 0, 1]),
        ([0, 0, 0], [0, 1, 1]),
        ([0, 0, 0], [1, 1, 1]),
        ([1, 0, 0], [0, 1, 0]),
        ([1, 0, 0], [0, 0, 1]),
        ([0, 1, 0], [0, 0, 1]),
        ([1, 0, 0], [0, 1, 1]),
        ([0, 1, 0], [1, 0, 1]),
        ([0, 0, 1], [1, 1, 0]),
    ];
    RAW.iter()
        .filter(|(a, b)| {
            let off = [b[0] - a[0], b[1] - a[1], b[2] - a[2]];
            offset_in_range(off, cell_len, interaction_length)
        })
        .map(|&(first, second)| {
            let off = [
                second[0] - first[0],
                second[1] - first[1],
                second[2] - first[2],
            ];
            BasePair { first, second, r_hat: r_hat_of(off, cell_len) }
        })
        .collect()
}

/// Half-space offsets of the c18 base step: `z > 0`, or `z = 0, y > 0`, or
/// `z = y = 0, x > 0`, within the overlap radius and pruned geometrically.
pub(crate) fn half_shell_offsets(
    overlap: [usize; 3],
    cell_len: V3,
    interaction_length: Real,
) -> Vec<[isize; 3]> {
    let mut out = Vec::new();
    let (ox, oy, oz) = (overlap[0] as isize, overlap[1] as isize, overlap[2] as isize);
    for z in 0..=oz {
        for y in -oy..=oy {
            for x in -ox..=ox {
                let keep = z > 0 || (z == 0 && y > 0) || (z == 0 && y == 0 && x > 0);
                if keep && offset_in_range([x, y, z], cell_len, interaction_length) {
                    out.push([x, y, z]);
                }
            }
        }
    }
    out
}

/// Full-sphere offsets of the c01 base step: every non-zero offset within the
/// overlap radius, pruned geometrically.
pub(crate) fn full_shell_offsets(
    overlap: [usize; 3],
    cell_len: V3,
    interaction_length: Real,
) -> Vec<[isize; 3]> {
    let mut out = Vec::new();
    let (ox, oy, oz) = (overlap[0] as isize, overlap[1] as isize, overlap[2] as isize);
    for z in -oz..=oz {
        for y in -oy..=oy {
            for x in -ox..=ox {
                if (x, y, z) != (0, 0, 0)
                    && offset_in_range([x, y, z], cell_len, interaction_length)
                {
                    out.push([x, y, z]);
                }
            }
        }
    }
    out
}

// ============================================================================
// Color partitioning
// ============================================================================

/// Partition the anchor cells (coordinates below `anchor_max` per axis) into
/// color classes by coordinate stride. Base steps of equal color touch
/// disjoint cell sets whenever the stride dominates the base step's reach.
pub(crate) fn partition_colors(
    dims: [usize; 3],
    anchor_max: [usize; 3],
    stride: [usize; 3],
) -> Vec<Vec<usize>> {
    let num_colors = stride[0] * stride[1] * stride[2];
    let mut colors: Vec<Vec<usize>> = vec![Vec::new(); num_colors];
    for z in 0..anchor_max[2] {
        for y in 0..anchor_max[1] {
            for x in 0..anchor_max[0] {
                let color =
                    (x % stride[0]) + stride[0] * ((y % stride[1]) + stride[1] * (z % stride[2]));
                colors[color].push(geometry::flat_index([x, y, z], dims));
            }
        }
    }
    colors.retain(|c| !c.is_empty());
    colors
}

/// One full c08-style base step at `base`: the anchor cell's own pairs plus
/// every retained cell pair of the 2x2x2 block.
pub(crate) fn run_base_step<P, C, F>(
    cells: &[Mutex<C>],
    cf: &CellFunctor<'_, P, F>,
    base: usize,
    pairs: &[FlatPair],
) where
    P: Particle,
    C: ParticleCell<P>,
    F: crate::functor::Functor<P>,
{
    {
        let mut g = lock(cells, base);
        cf.process_cell(&mut *g);
    }
    for fp in pairs {
        let a = (base as isize + fp.d1) as usize;
        let b = (base as isize + fp.d2) as usize;
        let (mut ga, mut gb) = lock_two(cells, a, b);
        cf.process_cell_pair(&mut *ga, &mut *gb, fp.r_hat);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn c08_base_step_covers_all_offset_classes_once() {
        let pairs = c08_base_pairs([1.0; 3], 1.0);
        assert_eq!(pairs.len(), 13);
        // Normalize second - first up to sign; all 13 classes must be hit.
        let mut classes: Vec<[isize; 3]> = pairs
            .iter()
            .map(|p| {
                let mut d = [
                    p.second[0] - p.first[0],
                    p.second[1] - p.first[1],
                    p.second[2] - p.first[2],
                ];
                // Canonical sign: first non-zero component positive.
                let lead = d.iter().find(|&&c| c != 0).copied().unwrap();
                if lead < 0 {
                    d = [-d[0], -d[1], -d[2]];
                }
                d
            })
            .collect();
        classes.sort();
        classes.dedup();
        assert_eq!(classes.len(), 13);
    }

    #[test]
    fn half_shell_has_13_offsets_at_overlap_one() {
        let offs = half_shell_offsets([1, 1, 1], [1.0; 3], 1.0);
        assert_eq!(offs.len(), 13);
        assert!(offs.iter().all(|o| o[2] > 0
            || (o[2] == 0 && o[1] > 0)
            || (o[2] == 0 && o[1] == 0 && o[0] > 0)));
    }

    #[test]
    fn full_shell_has_26_offsets_at_overlap_one() {
        assert_eq!(full_shell_offsets([1, 1, 1], [1.0; 3], 1.0).len(), 26);
    }

    #[test]
    fn geometric_pruning_drops_far_corners() {
        // Overlap 2 with big cells: the (2,2,2) corner sits sqrt(3) cells
        // away and must be pruned for a short interaction length.
        let offs = full_shell_offsets([2, 2, 2], [1.0; 3], 1.0);
        assert!(!offs.contains(&[2, 2, 2]));
        assert!(offs.contains(&[2, 0, 0]));
    }

    #[test]
    fn traversal_surface_reports_its_configuration() {
        use crate::cell_block::CellBlock;
        use crate::functor::DataLayout;

        let block = CellBlock::new([0.0; 3], [10.0; 3], 1.0, 0.2, 1.0).unwrap();
        let checks: Vec<(TraversalKind, bool, Box<dyn CellPairTraversal>)> = vec![
            (
                TraversalKind::C08,
                true,
                Box::new(C08Traversal::new(&block, DataLayout::Soa, true).unwrap()),
            ),
            (
                TraversalKind::C18,
                false,
                Box::new(C18Traversal::new(&block, DataLayout::Aos, false).unwrap()),
            ),
            (
                TraversalKind::C01,
                false,
                Box::new(C01Traversal::new(&block, DataLayout::Aos, false).unwrap()),
            ),
            (
                TraversalKind::C04Soa,
                true,
                Box::new(
                    C04Traversal::new(&block, DataLayout::Soa, true, TraversalKind::C04Soa)
                        .unwrap(),
                ),
            ),
            (
                TraversalKind::Sliced,
                true,
                Box::new(SlicedTraversal::new(&block, DataLayout::Aos, true).unwrap()),
            ),
        ];
        for (kind, newton3, traversal) in checks {
            assert_eq!(traversal.traversal_type(), kind);
            assert_eq!(traversal.use_newton3(), newton3);
        }

        // Static feasibility is rejected at construction time.
        assert!(C01Traversal::new(&block, DataLayout::Aos, true).is_err());
        assert!(C04Traversal::new(&block, DataLayout::Aos, true, TraversalKind::C04Soa).is_err());
        assert!(C08Traversal::new(&block, DataLayout::Cuda, true).is_err());
    }

    #[test]
    fn color_partition_is_complete_and_disjoint() {
        let dims = [6, 6, 6];
        let colors = partition_colors(dims, [5, 5, 5], [2, 2, 2]);
        assert_eq!(colors.len(), 8);
        let mut all: Vec<usize> = colors.concat();
        all.sort_unstable();
        assert_eq!(all.len(), 125);
        all.dedup();
        assert_eq!(all.len(), 125);
    }
}
