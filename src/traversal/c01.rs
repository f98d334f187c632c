//! c01: full-shell traversal, no coloring
//!
//! Every cell anchors a base step over its *entire* neighbor shell and the
//! cell functor runs one-sided, so a base step only ever writes the anchor
//! cell's particles. That makes any number of concurrent base steps safe
//! without a color partition — at the price of forfeiting Newton-3: the
//! traversal is inapplicable with reciprocity enabled.

use std::sync::Mutex;

use rayon::prelude::*;

use crate::cell::ParticleCell;
use crate::cell_block::CellBlock;
use crate::cell_functor::CellFunctor;
use crate::functor::{DataLayout, Functor};
use crate::geometry;
use crate::particle::Particle;
use crate::traversal::{
    full_shell_offsets, lock_two, r_hat_of, CellPairTraversal, TraversalKind,
};
use crate::V3;

/// Colorless full-shell traversal (no Newton-3).
pub struct C01Traversal {
    layout: DataLayout,
    dims: [usize; 3],
    offsets: Vec<([isize; 3], Option<V3>)>,
}

impl C01Traversal {
    /// Build the full-shell offset schedule for `block`.
    pub fn new(
        block: &CellBlock,
        layout: DataLayout,
        newton3: bool,
    ) -> Result<Self, &'static str> {
        if layout == DataLayout::Cuda {
            return Err("no cuda device available");
        }
        if newton3 {
            return Err("c01 writes only the anchor cell and cannot exploit newton3");
        }
        let dims = block.dims();
        let cell_len = block.cell_length();
        let offsets = full_shell_offsets(block.overlap(), cell_len, block.interaction_length())
            .into_iter()
            .map(|o| (o, r_hat_of(o, cell_len)))
            .collect();
        Ok(Self { layout, dims, offsets })
    }

    /// Visit all cells in one parallel phase.
    pub fn traverse<P, C, F>(&self, cells: &[Mutex<C>], functor: &F)
    where
        P: Particle,
        C: ParticleCell<P>,
        F: Functor<P>,
    {
        let cf = CellFunctor::one_sided(functor, self.layout);
        (0..cells.len()).into_par_iter().for_each(|base| {
            {
                let mut g = crate::traversal::lock(cells, base);
                cf.process_cell(&mut *g);
            }
            let coord = geometry::coord_of(base, self.dims);
            for (off, r_hat) in &self.offsets {
                let Some(other) = geometry::offset_coord(coord, *off, self.dims) else {
                    continue;
                };
                let other = geometry::flat_index(other, self.dims);
                let (mut ga, mut gb) = lock_two(cells, base, other);
                cf.process_cell_pair(&mut *ga, &mut *gb, *r_hat);
            }
        });
    }
}

impl CellPairTraversal for C01Traversal {
    fn traversal_type(&self) -> TraversalKind {
        TraversalKind::C01
    }

    fn use_newton3(&self) -> bool {
        false
    }

    fn data_layout(&self) -> DataLayout {
        self.layout
    }
}
