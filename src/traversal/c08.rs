//! c08: eight-color base-step traversal
//!
//! The canonical Newton-3-friendly scheme. A 2x2x2 block anchored at the base
//! cell enumerates the 13 unique unordered cell pairs whose difference classes
//! cover the whole neighbor shell; the block is applied at every cell below
//! the far wall. Eight colors (stride 2 per axis) make same-color blocks
//! disjoint, so each color phase parallelizes freely.

use std::sync::Mutex;

use rayon::prelude::*;

use crate::cell::ParticleCell;
use crate::cell_block::CellBlock;
use crate::cell_functor::CellFunctor;
use crate::functor::{DataLayout, Functor};
use crate::particle::Particle;
use crate::traversal::{
    c08_base_pairs, flatten_pairs, partition_colors, run_base_step, CellPairTraversal, FlatPair,
    TraversalKind,
};

/// Eight-color 2x2x2 base-step traversal.
pub struct C08Traversal {
    layout: DataLayout,
    newton3: bool,
    pairs: Vec<FlatPair>,
    colors: Vec<Vec<usize>>,
}

impl C08Traversal {
    /// Build the offset schedule and color partition for `block`.
    pub fn new(
        block: &CellBlock,
        layout: DataLayout,
        newton3: bool,
    ) -> Result<Self, &'static str> {
        if layout == DataLayout::Cuda {
            return Err("no cuda device available");
        }
        if block.overlap() != [1, 1, 1] {
            return Err("c08 base step requires overlap 1");
        }
        let dims = block.dims();
        let pairs = flatten_pairs(
            &c08_base_pairs(block.cell_length(), block.interaction_length()),
            dims,
        );
        let anchor_max = [dims[0] - 1, dims[1] - 1, dims[2] - 1];
        let colors = partition_colors(dims, anchor_max, [2, 2, 2]);
        Ok(Self { layout, newton3, pairs, colors })
    }

    /// Visit all cell pairs. One parallel phase per color; the phase boundary
    /// is the barrier between colors.
    pub fn traverse<P, C, F>(&self, cells: &[Mutex<C>], functor: &F)
    where
        P: Particle,
        C: ParticleCell<P>,
        F: Functor<P>,
    {
        let cf = CellFunctor::new(functor, self.layout, self.newton3);
        for color in &self.colors {
            color
                .par_iter()
                .for_each(|&base| run_base_step(cells, &cf, base, &self.pairs));
        }
    }
}

impl CellPairTraversal for C08Traversal {
    fn traversal_type(&self) -> TraversalKind {
        TraversalKind::C08
    }

    fn use_newton3(&self) -> bool {
        self.newton3
    }

    fn data_layout(&self) -> DataLayout {
        self.layout
    }
}
