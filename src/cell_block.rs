//! Domain-to-grid mapping
//!
//! A [`CellBlock`] maps the simulation box `[box_min, box_max]` to a dense 3D
//! array of cells with **one halo layer on each side**. The interior cell side
//! length per axis is `max(r_c + skin, cell_size_factor * r_c)` rounded so the
//! cells evenly divide the box; the index mapping is lexicographic,
//! `idx = x + nx * (y + ny * z)`.
//!
//! Border classification is exposed through the [`CellBorderAndFlagManager`]
//! capability: interior cells can contain owned particles, the outermost layer
//! can contain halo particles.

use crate::{geometry, Real, V3};

/// Errors surfaced while laying out the grid.
#[derive(Debug, thiserror::Error)]
pub enum GridError {
    /// The box has a non-positive extent on some axis.
    #[error("degenerate box: min {min:?}, max {max:?}")]
    DegenerateBox {
        /// Lower corner.
        min: V3,
        /// Upper corner.
        max: V3,
    },
    /// Cutoff, skin or cell size factor out of range.
    #[error("bad interaction parameters: cutoff {cutoff}, skin {skin}, cell size factor {csf}")]
    BadParameters {
        /// Interaction cutoff.
        cutoff: Real,
        /// Verlet skin.
        skin: Real,
        /// Cell size factor.
        csf: Real,
    },
}

/// Dense 3D grid of cells over a box, including the halo layer.
#[derive(Debug, Clone)]
pub struct CellBlock {
    box_min: V3,
    box_max: V3,
    cutoff: Real,
    skin: Real,
    cell_length: V3,
    dims: [usize; 3],
    overlap: [usize; 3],
}

impl CellBlock {
    /// Lay out the grid.
    ///
    /// `dims` ends up as interior cells plus two halo layers per axis; the
    /// overlap per axis is the number of cells the interaction sphere
    /// (`cutoff + skin`) reaches.
    pub fn new(
        box_min: V3,
        box_max: V3,
        cutoff: Real,
        skin: Real,
        cell_size_factor: Real,
    ) -> Result<Self, GridError> {
        if !(cutoff > 0.0) || skin < 0.0 || !(cell_size_factor > 0.0) {
            return Err(GridError::BadParameters { cutoff, skin, csf: cell_size_factor });
        }
        for d in 0..3 {
            if !(box_max[d] > box_min[d]) {
                return Err(GridError::DegenerateBox { min: box_min, max: box_max });
            }
        }

        let interaction_length = cutoff + skin;
        let target = interaction_length.max(cell_size_factor * cutoff);
        let mut cell_length = [0.0; 3];
        let mut dims = [0usize; 3];
        let mut overlap = [0usize; 3];
        for d in 0..3 {
            let len = box_max[d] - box_min[d];
            let interior = ((len / target).floor() as usize).max(1);
            cell_length[d] = len / interior as Real;
            dims[d] = interior + 2;
            overlap[d] = (interaction_length / cell_length[d]).ceil() as usize;
        }

        Ok(Self { box_min, box_max, cutoff, skin, cell_length, dims, overlap })
    }

    /// Lower corner of the box (halo excluded).
    pub fn box_min(&self) -> V3 {
        self.box_min
    }

    /// Upper corner of the box (halo excluded).
    pub fn box_max(&self) -> V3 {
        self.box_max
    }

    /// Interaction cutoff `r_c`.
    pub fn cutoff(&self) -> Real {
        self.cutoff
    }

    /// Verlet skin.
    pub fn skin(&self) -> Real {
        self.skin
    }

    /// `r_c + skin`.
    pub fn interaction_length(&self) -> Real {
        self.cutoff + self.skin
    }

    /// Grid dimensions including the halo layer.
    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    /// Total number of cells.
    pub fn num_cells(&self) -> usize {
        self.dims[0] * self.dims[1] * self.dims[2]
    }

    /// Side lengths of one cell.
    pub fn cell_length(&self) -> V3 {
        self.cell_length
    }

    /// Cells reached by the interaction sphere, per axis.
    pub fn overlap(&self) -> [usize; 3] {
        self.overlap
    }

    /// Grid coordinate of a position. Positions outside the box land in the
    /// halo layer; positions beyond one halo layer are clamped into it.
    pub fn coord_of_position(&self, r: V3) -> [usize; 3] {
        let mut coord = [0usize; 3];
        for d in 0..3 {
            let rel = (r[d] - self.box_min[d]) / self.cell_length[d];
            let c = rel.floor() as isize + 1;
            coord[d] = c.clamp(0, self.dims[d] as isize - 1) as usize;
        }
        coord
    }

    /// Flat cell index of a position.
    pub fn index_of_position(&self, r: V3) -> usize {
        geometry::flat_index(self.coord_of_position(r), self.dims)
    }

    /// Whether the coordinate lies in the interior (owned) region.
    pub fn is_interior(&self, coord: [usize; 3]) -> bool {
        (0..3).all(|d| coord[d] >= 1 && coord[d] + 2 <= self.dims[d])
    }

    /// Whether a position lies strictly inside `[box_min, box_max)`.
    pub fn position_in_box(&self, r: V3) -> bool {
        (0..3).all(|d| r[d] >= self.box_min[d] && r[d] < self.box_max[d])
    }
}

/// Border classification capability consumed by traversals and iterators.
pub trait CellBorderAndFlagManager {
    /// Whether the cell at `index` may contain owned particles.
    fn cell_can_contain_owned(&self, index: usize) -> bool;
    /// Whether the cell at `index` may contain halo particles.
    fn cell_can_contain_halo(&self, index: usize) -> bool;
}

impl CellBorderAndFlagManager for CellBlock {
    fn cell_can_contain_owned(&self, index: usize) -> bool {
        self.is_interior(geometry::coord_of(index, self.dims))
    }

    fn cell_can_contain_halo(&self, index: usize) -> bool {
        !self.is_interior(geometry::coord_of(index, self.dims))
    }
}
