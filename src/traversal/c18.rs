//! c18: eighteen-color half-shell traversal
//!
//! Every cell anchors its own base step, pairing with the half-space of
//! neighbors `z > 0` (and `y > 0` on the `z = 0` plane, `x > 0` on its
//! `y = 0` line), so each unordered cell pair is enumerated exactly once.
//! The base step writes a 3x3x2 region, hence stride (3, 3, 2): 18 colors.

use std::sync::Mutex;

use rayon::prelude::*;

use crate::cell::ParticleCell;
use crate::cell_block::CellBlock;
use crate::cell_functor::CellFunctor;
use crate::functor::{DataLayout, Functor};
use crate::geometry;
use crate::particle::Particle;
use crate::traversal::{
    half_shell_offsets, lock, lock_two, partition_colors, r_hat_of, CellPairTraversal,
    TraversalKind,
};
use crate::V3;

/// Eighteen-color half-shell traversal.
pub struct C18Traversal {
    layout: DataLayout,
    newton3: bool,
    dims: [usize; 3],
    offsets: Vec<([isize; 3], Option<V3>)>,
    colors: Vec<Vec<usize>>,
}

impl C18Traversal {
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
            return Err("c18 coloring requires overlap 1");
        }
        let dims = block.dims();
        let cell_len = block.cell_length();
        let offsets = half_shell_offsets(block.overlap(), cell_len, block.interaction_length())
            .into_iter()
            .map(|o| (o, r_hat_of(o, cell_len)))
            .collect();
        let colors = partition_colors(dims, dims, [3, 3, 2]);
        Ok(Self { layout, newton3, dims, offsets, colors })
    }

    /// Visit all cell pairs, one parallel phase per color.
    pub fn traverse<P, C, F>(&self, cells: &[Mutex<C>], functor: &F)
    where
        P: Particle,
        C: ParticleCell<P>,
        F: Functor<P>,
    {
        let cf = CellFunctor::new(functor, self.layout, self.newton3);
        for color in &self.colors {
            color.par_iter().for_each(|&base| {
                {
                    let mut g = lock(cells, base);
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
}

impl CellPairTraversal for C18Traversal {
    fn traversal_type(&self) -> TraversalKind {
        TraversalKind::C18
    }

    fn use_newton3(&self) -> bool {
        self.newton3
    }

    fn data_layout(&self) -> DataLayout {
        self.layout
    }
}
