//! Static 2-D occupancy grid.
//!
//! The grid is a row-major array of cells covering a rectangle of the world
//! plane.  `origin` is the world position of the outer corner of cell
//! `(0, 0)`; cell `(cx, cy)` spans
//! `[origin.x + cx·res, origin.x + (cx+1)·res)` along X and likewise along Y.
//!
//! # Example
//!
//! ```rust
//! use relume_planning::grid::OccupancyGrid;
//!
//! let mut grid = OccupancyGrid::new(10, 10, 0.1, (0.0, 0.0));
//! grid.set_occupied(5, 5, true);
//! assert!(!grid.is_free(5, 5));
//! assert_eq!(grid.world_to_cell(0.55, 0.52), Some((5, 5)));
//! ```

use relume_types::RelumeError;
use serde::{Deserialize, Serialize};

/// Axis-aligned rectangular obstacle in world metres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Obstacle {
    pub min_x_m: f32,
    pub min_y_m: f32,
    pub max_x_m: f32,
    pub max_y_m: f32,
}

/// Serialisable description of a static map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub width_cells: usize,
    pub height_cells: usize,
    pub resolution_m: f32,
    pub origin_x_m: f32,
    pub origin_y_m: f32,
    /// Obstacles are grown by this radius before planning.
    pub inflation_radius_m: f32,
    pub obstacles: Vec<Obstacle>,
}

impl Default for GridConfig {
    fn default() -> Self {
        // A 10 m × 10 m empty arena centred on the start pose.
        Self {
            width_cells: 100,
            height_cells: 100,
            resolution_m: 0.1,
            origin_x_m: -5.0,
            origin_y_m: -5.0,
            inflation_radius_m: 0.2,
            obstacles: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OccupancyGrid {
    width: usize,
    height: usize,
    resolution_m: f32,
    origin: (f32, f32),
    cells: Vec<bool>,
}

impl OccupancyGrid {
    /// An all-free grid.  Non-positive resolutions fall back to 1 m.
    pub fn new(width: usize, height: usize, resolution_m: f32, origin: (f32, f32)) -> Self {
        let resolution_m = if resolution_m > 0.0 { resolution_m } else { 1.0 };
        Self {
            width,
            height,
            resolution_m,
            origin,
            cells: vec![false; width * height],
        }
    }

    /// Build and rasterise the obstacles of `config` (no inflation applied).
    ///
    /// # Errors
    ///
    /// [`RelumeError::Config`] for an empty grid or a non-positive resolution.
    pub fn from_config(config: &GridConfig) -> Result<Self, RelumeError> {
        if config.width_cells == 0 || config.height_cells == 0 {
            return Err(RelumeError::Config("occupancy grid has no cells".to_string()));
        }
        if config.resolution_m.is_nan() || config.resolution_m <= 0.0 {
            return Err(RelumeError::Config(format!(
                "grid resolution must be positive, got {}",
                config.resolution_m
            )));
        }
        let mut grid = Self::new(
            config.width_cells,
            config.height_cells,
            config.resolution_m,
            (config.origin_x_m, config.origin_y_m),
        );
        for obstacle in &config.obstacles {
            grid.fill_rect(obstacle);
        }
        Ok(grid)
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn resolution_m(&self) -> f32 {
        self.resolution_m
    }

    pub fn origin(&self) -> (f32, f32) {
        self.origin
    }

    /// Cell containing the world point, or `None` outside the grid.
    pub fn world_to_cell(&self, x_m: f32, y_m: f32) -> Option<(usize, usize)> {
        let fx = ((x_m - self.origin.0) / self.resolution_m).floor();
        let fy = ((y_m - self.origin.1) / self.resolution_m).floor();
        if fx < 0.0 || fy < 0.0 || fx >= self.width as f32 || fy >= self.height as f32 {
            return None;
        }
        Some((fx as usize, fy as usize))
    }

    /// World position of the centre of cell `(cx, cy)`.
    pub fn cell_to_world(&self, cx: usize, cy: usize) -> (f32, f32) {
        (
            self.origin.0 + (cx as f32 + 0.5) * self.resolution_m,
            self.origin.1 + (cy as f32 + 0.5) * self.resolution_m,
        )
    }

    pub fn in_bounds(&self, cx: i64, cy: i64) -> bool {
        cx >= 0 && cy >= 0 && (cx as usize) < self.width && (cy as usize) < self.height
    }

    /// Out-of-range writes are ignored.
    pub fn set_occupied(&mut self, cx: usize, cy: usize, occupied: bool) {
        if cx < self.width && cy < self.height {
            self.cells[cy * self.width + cx] = occupied;
        }
    }

    /// `false` for occupied cells and for anything outside the grid.
    pub fn is_free(&self, cx: usize, cy: usize) -> bool {
        cx < self.width && cy < self.height && !self.cells[cy * self.width + cx]
    }

    pub fn occupied_count(&self) -> usize {
        self.cells.iter().filter(|&&c| c).count()
    }

    /// `true` when the straight segment between the two cell centres only
    /// crosses free cells.
    ///
    /// Every cell the segment touches is visited; where it passes exactly
    /// through a cell corner both side cells must be free, matching the
    /// planner's no-corner-cutting rule.
    pub fn line_of_sight(&self, from: (usize, usize), to: (usize, usize)) -> bool {
        let free = |x: i64, y: i64| self.in_bounds(x, y) && self.is_free(x as usize, y as usize);
        let (mut x, mut y) = (from.0 as i64, from.1 as i64);
        let (tx, ty) = (to.0 as i64, to.1 as i64);
        let (dx, dy) = ((tx - x).abs(), (ty - y).abs());
        let (sx, sy) = ((tx - x).signum(), (ty - y).signum());
        if !free(x, y) {
            return false;
        }
        let (mut ix, mut iy) = (0i64, 0i64);
        while ix < dx || iy < dy {
            let decision = (1 + 2 * ix) * dy - (1 + 2 * iy) * dx;
            if decision == 0 {
                if !free(x + sx, y) || !free(x, y + sy) {
                    return false;
                }
                x += sx;
                y += sy;
                ix += 1;
                iy += 1;
            } else if decision < 0 {
                x += sx;
                ix += 1;
            } else {
                y += sy;
                iy += 1;
            }
            if !free(x, y) {
                return false;
            }
        }
        true
    }

    /// Mark every cell whose centre lies within `obstacle`.
    pub fn fill_rect(&mut self, obstacle: &Obstacle) {
        for cy in 0..self.height {
            for cx in 0..self.width {
                let (x, y) = self.cell_to_world(cx, cy);
                if x >= obstacle.min_x_m && x <= obstacle.max_x_m && y >= obstacle.min_y_m && y <= obstacle.max_y_m {
                    self.cells[cy * self.width + cx] = true;
                }
            }
        }
    }

    /// Copy of the grid with every occupied cell grown by a disc of
    /// `radius_m`, so a point robot can plan for a round one.
    pub fn inflate(&self, radius_m: f32) -> Self {
        let r = (radius_m.max(0.0) / self.resolution_m).ceil() as i64;
        if r == 0 {
            return self.clone();
        }
        let r2 = (radius_m / self.resolution_m).powi(2);
        let mut out = self.clone();
        for cy in 0..self.height as i64 {
            for cx in 0..self.width as i64 {
                if !self.cells[cy as usize * self.width + cx as usize] {
                    continue;
                }
                for dy in -r..=r {
                    for dx in -r..=r {
                        if (dx * dx + dy * dy) as f32 > r2 || !self.in_bounds(cx + dx, cy + dy) {
                            continue;
                        }
                        out.cells[(cy + dy) as usize * self.width + (cx + dx) as usize] = true;
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn world_cell_conversion() {
        let grid = OccupancyGrid::new(20, 10, 0.5, (-5.0, -2.5));
        assert_eq!(grid.world_to_cell(-5.0, -2.5), Some((0, 0)));
        assert_eq!(grid.world_to_cell(0.1, 0.1), Some((10, 5)));
        assert_eq!(grid.world_to_cell(-5.01, 0.0), None);
        assert_eq!(grid.world_to_cell(5.0, 0.0), None);
        assert_eq!(grid.cell_to_world(10, 5), (0.25, 0.25));
    }

    #[test]
    fn out_of_range_cells_are_not_free() {
        let mut grid = OccupancyGrid::new(3, 3, 1.0, (0.0, 0.0));
        assert!(grid.is_free(2, 2));
        assert!(!grid.is_free(3, 0));
        grid.set_occupied(7, 7, true);
        assert_eq!(grid.occupied_count(), 0);
    }

    #[test]
    fn inflation_grows_a_disc() {
        let mut grid = OccupancyGrid::new(11, 11, 0.1, (0.0, 0.0));
        grid.set_occupied(5, 5, true);
        let inflated = grid.inflate(0.2);
        assert!(!inflated.is_free(5, 7));
        assert!(!inflated.is_free(6, 6));
        // Corner of the 5×5 square lies outside the radius.
        assert!(inflated.is_free(7, 7));
        assert!(inflated.is_free(5, 8));
        assert_eq!(inflated.occupied_count(), 13);
        // Inflation returns a new grid.
        assert_eq!(grid.occupied_count(), 1);
    }

    #[test]
    fn line_of_sight_across_open_cells() {
        let grid = OccupancyGrid::new(10, 10, 0.1, (0.0, 0.0));
        assert!(grid.line_of_sight((0, 0), (9, 4)));
        assert!(grid.line_of_sight((9, 4), (0, 0)));
        assert!(grid.line_of_sight((3, 3), (3, 3)));
        assert!(!grid.line_of_sight((0, 0), (10, 0)), "target outside the grid");
    }

    #[test]
    fn walls_block_line_of_sight() {
        let mut grid = OccupancyGrid::new(10, 10, 0.1, (0.0, 0.0));
        for y in 0..8 {
            grid.set_occupied(5, y, true);
        }
        assert!(!grid.line_of_sight((0, 0), (9, 0)));
        assert!(!grid.line_of_sight((0, 2), (9, 6)));
        assert!(grid.line_of_sight((0, 9), (9, 9)));
        // Touching a cell only at the corner still counts as blocked when
        // either side cell is occupied.
        let mut corner = OccupancyGrid::new(3, 3, 1.0, (0.0, 0.0));
        corner.set_occupied(1, 0, true);
        assert!(!corner.line_of_sight((0, 0), (2, 2)));
        assert!(corner.line_of_sight((0, 1), (2, 2)));
    }

    #[test]
    fn zero_inflation_is_identity() {
        let mut grid = OccupancyGrid::new(4, 4, 0.25, (0.0, 0.0));
        grid.set_occupied(0, 0, true);
        assert_eq!(grid.inflate(0.0), grid);
    }

    #[test]
    fn from_config_rasterises_obstacles() {
        let config = GridConfig {
            width_cells: 10,
            height_cells: 10,
            resolution_m: 1.0,
            origin_x_m: 0.0,
            origin_y_m: 0.0,
            inflation_radius_m: 0.0,
            obstacles: vec![Obstacle {
                min_x_m: 2.0,
                min_y_m: 0.0,
                max_x_m: 3.0,
                max_y_m: 10.0,
            }],
        };
        let grid = OccupancyGrid::from_config(&config).unwrap();
        assert!(!grid.is_free(2, 0));
        assert!(grid.is_free(3, 0));
        assert_eq!(grid.occupied_count(), 10);
    }

    #[test]
    fn from_config_rejects_degenerate_grids() {
        let bad = GridConfig {
            resolution_m: 0.0,
            ..Default::default()
        };
        assert!(matches!(OccupancyGrid::from_config(&bad), Err(RelumeError::Config(_))));
        let empty = GridConfig {
            width_cells: 0,
            ..Default::default()
        };
        assert!(OccupancyGrid::from_config(&empty).is_err());
    }
}
