//! c04 / c04SoA: four-color column traversal
//!
//! The c08 base step applied along whole z-columns: one task owns the column
//! anchored at `(x, y)` and walks it bottom to top, so the 2x2 block of
//! columns it writes stays resident while an entire stripe of cells — and in
//! SoA mode their combined buffers — is processed. Four colors over `(x % 2,
//! y % 2)` keep same-color column blocks disjoint.
//!
//! `c04SoA` is the same schedule restricted to the SoA layout, where the
//! stripe reuse pays off.

use std::sync::Mutex;

use rayon::prelude::*;

use crate::cell::ParticleCell;
use crate::cell_block::CellBlock;
use crate::cell_functor::CellFunctor;
use crate::functor::{DataLayout, Functor};
use crate::geometry;
use crate::particle::Particle;
use crate::traversal::{
    c08_base_pairs, flatten_pairs, run_base_step, CellPairTraversal, FlatPair, TraversalKind,
};

/// Four-color z-column traversal.
pub struct C04Traversal {
    kind: TraversalKind,
    layout: DataLayout,
    newton3: bool,
    dims: [usize; 3],
    pairs: Vec<FlatPair>,
    /// Per color: the `(x, y)` anchors of the columns.
    colors: Vec<Vec<[usize; 2]>>,
}

impl C04Traversal {
    /// Build the column schedule. `kind` selects the plain variant or the
    /// SoA-only `c04SoA` applicability.
    pub fn new(
        block: &CellBlock,
        layout: DataLayout,
        newton3: bool,
        kind: TraversalKind,
    ) -> Result<Self, &'static str> {
        debug_assert!(matches!(kind, TraversalKind::C04 | TraversalKind::C04Soa));
        if layout == DataLayout::Cuda {
            return Err("no cuda device available");
        }
        if kind == TraversalKind::C04Soa && layout != DataLayout::Soa {
            return Err("c04SoA requires the soa layout");
        }
        if block.overlap() != [1, 1, 1] {
            return Err("c04 base step requires overlap 1");
        }
        let dims = block.dims();
        let pairs = flatten_pairs(
            &c08_base_pairs(block.cell_length(), block.interaction_length()),
            dims,
        );
        let mut colors: Vec<Vec<[usize; 2]>> = vec![Vec::new(); 4];
        for y in 0..dims[1] - 1 {
            for x in 0..dims[0] - 1 {
                colors[(x % 2) + 2 * (y % 2)].push([x, y]);
            }
        }
        colors.retain(|c| !c.is_empty());
        Ok(Self { kind, layout, newton3, dims, pairs, colors })
    }

    /// Visit all cell pairs, one parallel phase per color, one task per
    /// column.
    pub fn traverse<P, C, F>(&self, cells: &[Mutex<C>], functor: &F)
    where
        P: Particle,
        C: ParticleCell<P>,
        F: Functor<P>,
    {
        let cf = CellFunctor::new(functor, self.layout, self.newton3);
        for color in &self.colors {
            color.par_iter().for_each(|&[x, y]| {
                for z in 0..self.dims[2] - 1 {
                    let base = geometry::flat_index([x, y, z], self.dims);
                    run_base_step(cells, &cf, base, &self.pairs);
                }
            });
        }
    }
}

impl CellPairTraversal for C04Traversal {
    fn traversal_type(&self) -> TraversalKind {
        self.kind
    }

    fn use_newton3(&self) -> bool {
        self.newton3
    }

    fn data_layout(&self) -> DataLayout {
        self.layout
    }
}
