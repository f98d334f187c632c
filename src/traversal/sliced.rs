//! Sliced traversal: one slab per thread along the longest axis
//!
//! The grid's longest axis is cut into contiguous slabs, one worker per slab.
//! Each worker runs c08 base steps layer by layer, ascending. The only cells
//! two neighboring workers can both touch sit in the first layer past a slab
//! boundary, so one lock per slab edge suffices: a worker holds its lower
//! edge's lock while it processes its first layer (whose base steps write
//! into cells the previous worker's last layer also writes), and takes its
//! upper edge's lock before its last layer, releasing each as soon as the
//! boundary layer is done. Locks are only ever taken in ascending edge order,
//! so no circular wait can form.
//!
//! Applicability requires the longest axis to span at least `2 * overlap + 1`
//! cells; when fewer slabs than workers fit, the worker count is reduced to
//! the slab count.

use std::sync::Mutex;

use crate::cell::ParticleCell;
use crate::cell_block::CellBlock;
use crate::cell_functor::CellFunctor;
use crate::functor::{DataLayout, Functor};
use crate::geometry;
use crate::particle::Particle;
use crate::traversal::{
    c08_base_pairs, flatten_pairs, run_base_step, CellPairTraversal, FlatPair, TraversalKind,
};

/// Slab-per-thread traversal over the longest axis.
pub struct SlicedTraversal {
    layout: DataLayout,
    newton3: bool,
    dims: [usize; 3],
    cut_axis: usize,
    /// Half-open layer ranges, one per slab.
    slabs: Vec<(usize, usize)>,
    pairs: Vec<FlatPair>,
}

impl SlicedTraversal {
    /// Plan the slabs for `block` against the current worker pool.
    pub fn new(
        block: &CellBlock,
        layout: DataLayout,
        newton3: bool,
    ) -> Result<Self, &'static str> {
        if layout == DataLayout::Cuda {
            return Err("no cuda device available");
        }
        if block.overlap() != [1, 1, 1] {
            return Err("sliced base step requires overlap 1");
        }
        let dims = block.dims();
        let cut_axis =
            (0..3).max_by_key(|&d| dims[d]).expect("three axes always present");
        let overlap = block.overlap()[cut_axis];
        if dims[cut_axis] < 2 * overlap + 1 {
            return Err("longest axis too short to cut even one slab");
        }

        // Anchors exist below the far wall only.
        let layers = dims[cut_axis] - 1;
        let workers = rayon::current_num_threads().max(1);
        let num_slabs = workers.min(layers / overlap).max(1);
        if num_slabs < workers {
            tracing::warn!(
                workers,
                num_slabs,
                "sliced traversal reduced its worker count to the slab count"
            );
        }
        let mut slabs = Vec::with_capacity(num_slabs);
        let mut start = 0usize;
        for s in 0..num_slabs {
            let end = start + layers / num_slabs + usize::from(s < layers % num_slabs);
            slabs.push((start, end));
            start = end;
        }

        let pairs = flatten_pairs(
            &c08_base_pairs(block.cell_length(), block.interaction_length()),
            dims,
        );
        Ok(Self { layout, newton3, dims, cut_axis, slabs, pairs })
    }

    /// Number of slabs (= workers) the plan ended up with.
    pub fn planned_slabs(&self) -> usize {
        self.slabs.len()
    }

    fn layer_anchors(&self, layer: usize) -> Vec<usize> {
        let (a1, a2) = match self.cut_axis {
            0 => (1, 2),
            1 => (0, 2),
            _ => (0, 1),
        };
        let mut out = Vec::with_capacity((self.dims[a1] - 1) * (self.dims[a2] - 1));
        for c2 in 0..self.dims[a2] - 1 {
            for c1 in 0..self.dims[a1] - 1 {
                let mut coord = [0usize; 3];
                coord[self.cut_axis] = layer;
                coord[a1] = c1;
                coord[a2] = c2;
                out.push(geometry::flat_index(coord, self.dims));
            }
        }
        out
    }

    /// Visit all cell pairs, one worker per slab.
    pub fn traverse<P, C, F>(&self, cells: &[Mutex<C>], functor: &F)
    where
        P: Particle,
        C: ParticleCell<P>,
        F: Functor<P>,
    {
        let cf = CellFunctor::new(functor, self.layout, self.newton3);
        let edges: Vec<Mutex<()>> =
            (0..self.slabs.len().saturating_sub(1)).map(|_| Mutex::new(())).collect();

        rayon::scope(|scope| {
            for (s, &(start, end)) in self.slabs.iter().enumerate() {
                let cf = &cf;
                let edges = &edges;
                scope.spawn(move |_| {
                    let mut lower_guard = if s > 0 {
                        Some(edges[s - 1].lock().expect("slab edge lock poisoned"))
                    } else {
                        None
                    };
                    let mut upper_guard = None;
                    for layer in start..end {
                        if layer + 1 == end && s + 1 < self.slabs.len() {
                            upper_guard =
                                Some(edges[s].lock().expect("slab edge lock poisoned"));
                        }
                        for base in self.layer_anchors(layer) {
                            run_base_step(cells, cf, base, &self.pairs);
                        }
                        if layer == start {
                            lower_guard = None;
                        }
                    }
                    drop(lower_guard);
                    drop(upper_guard);
                });
            }
        });
    }
}

impl CellPairTraversal for SlicedTraversal {
    fn traversal_type(&self) -> TraversalKind {
        TraversalKind::Sliced
    }

    fn use_newton3(&self) -> bool {
        self.newton3
    }

    fn data_layout(&self) -> DataLayout {
        self.layout
    }
}
