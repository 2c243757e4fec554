// SPDX-License-Identifier: MIT
// Copyright (c) 2025 TREX contributors

// ABOUTME: Flat row-major raster storage and the overland grid domain model
// ABOUTME: Provides GridMap<T> contiguous storage, cell masking, and compass-direction indexing

/// Flux source/destination channels for a cell or node.
///
/// Slot 0 is the location itself (point and distributed loads, kinetic
/// processes), slots 1-8 are the eight compass neighbors clockwise from
/// north, slot 9 is the floodplain interface between an overland cell and
/// its channel node, and slot 10 is the domain boundary (outlets, upstream
/// boundary inflows).
pub const SOURCE_COUNT: usize = 11;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Source {
    Point = 0,
    North = 1,
    Northeast = 2,
    East = 3,
    Southeast = 4,
    South = 5,
    Southwest = 6,
    West = 7,
    Northwest = 8,
    Floodplain = 9,
    Boundary = 10,
}

impl Source {
    /// The eight compass directions clockwise from north.
    pub const COMPASS: [Source; 8] = [
        Source::North,
        Source::Northeast,
        Source::East,
        Source::Southeast,
        Source::South,
        Source::Southwest,
        Source::West,
        Source::Northwest,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// (row, col) offset for a compass direction. Row 0 is the north edge.
    pub fn offset(self) -> (isize, isize) {
        match self {
            Source::North => (-1, 0),
            Source::Northeast => (-1, 1),
            Source::East => (0, 1),
            Source::Southeast => (1, 1),
            Source::South => (1, 0),
            Source::Southwest => (1, -1),
            Source::West => (0, -1),
            Source::Northwest => (-1, -1),
            _ => (0, 0),
        }
    }

    /// The direction a neighbor sees this cell from.
    pub fn opposite(self) -> Source {
        match self {
            Source::North => Source::South,
            Source::Northeast => Source::Southwest,
            Source::East => Source::West,
            Source::Southeast => Source::Northwest,
            Source::South => Source::North,
            Source::Southwest => Source::Northeast,
            Source::West => Source::East,
            Source::Northwest => Source::Southeast,
            other => other,
        }
    }

    /// Center-to-center distance factor in units of cell size.
    pub fn distance_factor(self) -> f64 {
        match self {
            Source::Northeast | Source::Southeast | Source::Southwest | Source::Northwest => {
                std::f64::consts::SQRT_2
            }
            _ => 1.0,
        }
    }
}

/// Domain membership of one raster cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CellMask {
    /// Outside the watershed (no-data).
    #[default]
    OutOfDomain,
    /// Overland cell with no channel.
    Overland,
    /// Overland cell containing a channel node.
    Channel,
}

impl CellMask {
    pub fn in_domain(self) -> bool {
        !matches!(self, CellMask::OutOfDomain)
    }
}

/// Flat 2-D raster storage with row-major layout.
///
/// A single contiguous allocation replaces the nested Vec<Vec<T>> pattern;
/// indexing is (row, col) with row 0 at the north edge of the domain.
#[derive(Clone, Debug, PartialEq)]
pub struct GridMap<T: Copy> {
    data: Vec<T>,
    rows: usize,
    cols: usize,
}

impl<T: Copy> GridMap<T> {
    pub fn new(rows: usize, cols: usize, default: T) -> Self {
        Self {
            data: vec![default; rows * cols],
            rows,
            cols,
        }
    }

    pub fn from_rows(rows: Vec<Vec<T>>) -> Self {
        let nrows = rows.len();
        let ncols = if nrows > 0 { rows[0].len() } else { 0 };
        let data = rows.into_iter().flatten().collect();
        Self {
            data,
            rows: nrows,
            cols: ncols,
        }
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> T {
        debug_assert!(
            row < self.rows && col < self.cols,
            "GridMap index out of bounds: ({}, {}) for {}x{}",
            row,
            col,
            self.rows,
            self.cols
        );
        self.data[row * self.cols + col]
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, value: T) {
        debug_assert!(
            row < self.rows && col < self.cols,
            "GridMap index out of bounds: ({}, {}) for {}x{}",
            row,
            col,
            self.rows,
            self.cols
        );
        self.data[row * self.cols + col] = value;
    }

    #[inline]
    pub fn get_mut(&mut self, row: usize, col: usize) -> &mut T {
        debug_assert!(
            row < self.rows && col < self.cols,
            "GridMap index out of bounds: ({}, {}) for {}x{}",
            row,
            col,
            self.rows,
            self.cols
        );
        &mut self.data[row * self.cols + col]
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn data(&self) -> &[T] {
        &self.data
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn fill(&mut self, value: T) {
        self.data.fill(value);
    }

    pub fn copy_from(&mut self, other: &GridMap<T>) {
        debug_assert_eq!(
            self.data.len(),
            other.data.len(),
            "GridMaps must have same dimensions for copy_from"
        );
        self.data.copy_from_slice(&other.data);
    }

    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        self.data.iter().copied()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> + '_ {
        self.data.iter_mut()
    }

    /// Iterator over (row, col, value) tuples.
    pub fn iter_cells(&self) -> impl Iterator<Item = (usize, usize, T)> + '_ {
        (0..self.rows).flat_map(move |r| (0..self.cols).map(move |c| (r, c, self.get(r, c))))
    }
}

impl GridMap<f64> {
    pub fn min(&self) -> f64 {
        self.data.iter().copied().fold(f64::INFINITY, f64::min)
    }

    pub fn max(&self) -> f64 {
        self.data.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    pub fn sum(&self) -> f64 {
        self.data.iter().sum()
    }
}

/// Static attributes of the overland raster domain.
///
/// Depths, concentrations, and fluxes live in the state arrays indexed by
/// (row, col); only time-invariant cell attributes are owned here.
#[derive(Clone, Debug)]
pub struct Grid {
    pub rows: usize,
    pub cols: usize,
    /// Cell pitch (m); cells are square.
    pub cell_size: f64,
    pub xll_corner: f64,
    pub yll_corner: f64,
    pub nodata: f64,
    pub mask: GridMap<CellMask>,
    /// Ground surface elevation (m).
    pub elevation: GridMap<f64>,
    pub land_use: GridMap<usize>,
    pub soil_type: GridMap<usize>,
    /// Terrain slope (m/m).
    pub slope: GridMap<f64>,
    /// Slope aspect (degrees clockwise from north).
    pub aspect: GridMap<f64>,
    /// Sky view factor (0-1).
    pub sky_view: GridMap<f64>,
    pub albedo: GridMap<f64>,
}

impl Grid {
    /// Uniform flat grid with every cell in the domain, for tests and
    /// programmatic setup.
    pub fn uniform(rows: usize, cols: usize, cell_size: f64, elevation: f64) -> Self {
        Self {
            rows,
            cols,
            cell_size,
            xll_corner: 0.0,
            yll_corner: 0.0,
            nodata: -9999.0,
            mask: GridMap::new(rows, cols, CellMask::Overland),
            elevation: GridMap::new(rows, cols, elevation),
            land_use: GridMap::new(rows, cols, 0),
            soil_type: GridMap::new(rows, cols, 0),
            slope: GridMap::new(rows, cols, 0.0),
            aspect: GridMap::new(rows, cols, 0.0),
            sky_view: GridMap::new(rows, cols, 1.0),
            albedo: GridMap::new(rows, cols, 0.2),
        }
    }

    /// Horizontal area of one cell (m2).
    #[inline]
    pub fn cell_area(&self) -> f64 {
        self.cell_size * self.cell_size
    }

    /// Flat index of a cell, for state arrays sized rows*cols.
    #[inline]
    pub fn index(&self, row: usize, col: usize) -> usize {
        row * self.cols + col
    }

    #[inline]
    pub fn cell_count(&self) -> usize {
        self.rows * self.cols
    }

    #[inline]
    pub fn is_domain(&self, row: usize, col: usize) -> bool {
        self.mask.get(row, col).in_domain()
    }

    /// Neighbor coordinates in a compass direction, if inside the raster
    /// and inside the domain.
    pub fn neighbor(&self, row: usize, col: usize, dir: Source) -> Option<(usize, usize)> {
        let (dr, dc) = dir.offset();
        let nr = row as isize + dr;
        let nc = col as isize + dc;
        if nr < 0 || nc < 0 || nr >= self.rows as isize || nc >= self.cols as isize {
            return None;
        }
        let (nr, nc) = (nr as usize, nc as usize);
        if self.is_domain(nr, nc) {
            Some((nr, nc))
        } else {
            None
        }
    }

    /// Iterator over all in-domain cells as (row, col).
    pub fn iter_domain(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        (0..self.rows)
            .flat_map(move |r| (0..self.cols).map(move |c| (r, c)))
            .filter(move |&(r, c)| self.is_domain(r, c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gridmap_creation() {
        let map = GridMap::new(8, 10, 0.5);
        assert_eq!(map.rows(), 8);
        assert_eq!(map.cols(), 10);
        assert_eq!(map.len(), 80);
        assert_eq!(map.get(3, 5), 0.5);
    }

    #[test]
    fn test_gridmap_indexing() {
        let mut map = GridMap::new(3, 4, 0.0);
        map.set(1, 2, 42.0);
        assert_eq!(map.get(1, 2), 42.0);

        *map.get_mut(2, 3) = 99.0;
        assert_eq!(map.get(2, 3), 99.0);
    }

    #[test]
    fn test_gridmap_iter_cells() {
        let map = GridMap::from_rows(vec![vec![1.0, 2.0], vec![3.0, 4.0]]);
        let cells: Vec<_> = map.iter_cells().collect();
        assert_eq!(
            cells,
            vec![(0, 0, 1.0), (0, 1, 2.0), (1, 0, 3.0), (1, 1, 4.0)]
        );
    }

    #[test]
    fn test_source_opposite_roundtrip() {
        for dir in Source::COMPASS {
            assert_eq!(dir.opposite().opposite(), dir);
            let (dr, dc) = dir.offset();
            let (or, oc) = dir.opposite().offset();
            assert_eq!((dr + or, dc + oc), (0, 0));
        }
    }

    #[test]
    fn test_grid_neighbor_bounds() {
        let grid = Grid::uniform(2, 2, 30.0, 100.0);
        assert_eq!(grid.neighbor(0, 0, Source::North), None);
        assert_eq!(grid.neighbor(0, 0, Source::South), Some((1, 0)));
        assert_eq!(grid.neighbor(0, 0, Source::Southeast), Some((1, 1)));
    }

    #[test]
    fn test_grid_neighbor_masked() {
        let mut grid = Grid::uniform(2, 2, 30.0, 100.0);
        grid.mask.set(1, 0, CellMask::OutOfDomain);
        assert_eq!(grid.neighbor(0, 0, Source::South), None);
    }

    #[test]
    fn test_iter_domain_skips_nodata() {
        let mut grid = Grid::uniform(2, 2, 30.0, 0.0);
        grid.mask.set(0, 1, CellMask::OutOfDomain);
        let cells: Vec<_> = grid.iter_domain().collect();
        assert_eq!(cells, vec![(0, 0), (1, 0), (1, 1)]);
    }
}
