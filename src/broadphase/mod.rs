//! Broad-phase collision detection over a fixed-extent uniform 2D grid.
//!
//! Bodies are re-inserted from scratch every tick and candidate pairs are
//! generated per cell with order-independent dedup. Pairs reference bodies
//! by the caller's identity type and never own them.

use std::hash::{Hash, Hasher};

use fxhash::FxHashSet;
use glam::Vec2;

use crate::geometry::Aabb;

/// Unordered candidate pair. Equality ignores endpoint order and the hash is
/// symmetric, so `{a, b}` and `{b, a}` collapse in a set.
#[derive(Debug, Clone, Copy)]
pub struct CollisionPair<B> {
    pub a: B,
    pub b: B,
}

impl<B> CollisionPair<B> {
    pub fn new(a: B, b: B) -> Self {
        Self { a, b }
    }
}

impl<B: PartialEq> PartialEq for CollisionPair<B> {
    fn eq(&self, other: &Self) -> bool {
        (self.a == other.a && self.b == other.b) || (self.a == other.b && self.b == other.a)
    }
}

impl<B: Eq> Eq for CollisionPair<B> {}

impl<B: Hash> Hash for CollisionPair<B> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let h1 = fxhash::hash64(&self.a);
        let h2 = fxhash::hash64(&self.b);
        // Symmetric combination: order the endpoint hashes first.
        let combined = if h1 < h2 {
            h1 ^ (h2 << 1)
        } else {
            h2 ^ (h1 << 1)
        };
        state.write_u64(combined);
    }
}

/// Usage counters for one grid state.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GridStats {
    pub total_cells: usize,
    pub occupied_cells: usize,
    pub max_objects_per_cell: usize,
    pub average_objects_per_occupied_cell: f32,
    pub total_objects: usize,
    pub potential_pairs: usize,
}

/// Uniform 2D grid over a fixed world rectangle.
///
/// Cells are pre-allocated at full extent (this is not a spatial hash);
/// bodies land in every cell their AABB overlaps, using the x/y axes of the
/// world-space box. Single-threaded by contract.
pub struct BroadPhaseGrid<B> {
    cell_size: f32,
    world_min: Vec2,
    world_max: Vec2,
    width: i32,
    height: i32,
    cells: Vec<Vec<B>>,
    pairs: Vec<CollisionPair<B>>,
    seen: FxHashSet<CollisionPair<B>>,
}

impl<B: Copy + Eq + Hash> BroadPhaseGrid<B> {
    pub fn new(cell_size: f32, world_min: Vec2, world_max: Vec2) -> Self {
        let mut grid = Self {
            cell_size: 0.0,
            world_min,
            world_max,
            width: 0,
            height: 0,
            cells: Vec::new(),
            pairs: Vec::with_capacity(1024),
            seen: FxHashSet::default(),
        };
        grid.resize(cell_size, world_min, world_max);
        grid
    }

    /// Reconfigure dimensions. Invalidates all inserted bodies and pairs.
    pub fn resize(&mut self, cell_size: f32, world_min: Vec2, world_max: Vec2) {
        assert!(cell_size > 0.0, "cell size must be positive");
        assert!(
            world_max.x > world_min.x && world_max.y > world_min.y,
            "world bounds must have positive area"
        );
        self.cell_size = cell_size;
        self.world_min = world_min;
        self.world_max = world_max;

        let world_size = world_max - world_min;
        self.width = (world_size.x / cell_size).ceil() as i32 + 1;
        self.height = (world_size.y / cell_size).ceil() as i32 + 1;

        self.cells.clear();
        self.cells
            .resize_with((self.width * self.height) as usize, || Vec::with_capacity(8));
        self.pairs.clear();
        self.seen.clear();
    }

    /// Cell holding a world position, clamped to the grid edge.
    pub fn cell_index(&self, position: Vec2) -> usize {
        let local = position - self.world_min;
        let x = ((local.x / self.cell_size) as i32).clamp(0, self.width - 1);
        let y = ((local.y / self.cell_size) as i32).clamp(0, self.height - 1);
        (y * self.width + x) as usize
    }

    fn cell_range(&self, bounds: &Aabb) -> (i32, i32, i32, i32) {
        let min_local = Vec2::new(bounds.min.x, bounds.min.y) - self.world_min;
        let max_local = Vec2::new(bounds.max.x, bounds.max.y) - self.world_min;
        let min_x = ((min_local.x / self.cell_size) as i32).max(0);
        let min_y = ((min_local.y / self.cell_size) as i32).max(0);
        let max_x = ((max_local.x / self.cell_size) as i32).min(self.width - 1);
        let max_y = ((max_local.y / self.cell_size) as i32).min(self.height - 1);
        (min_x, min_y, max_x, max_y)
    }

    /// Register one body in every cell its bounds overlap.
    pub fn insert(&mut self, body: B, bounds: &Aabb) {
        let (min_x, min_y, max_x, max_y) = self.cell_range(bounds);
        for y in min_y..=max_y {
            for x in min_x..=max_x {
                self.cells[(y * self.width + x) as usize].push(body);
            }
        }
    }

    /// Clear the grid and re-insert the full body set.
    pub fn update<I>(&mut self, bodies: I)
    where
        I: IntoIterator<Item = (B, Aabb)>,
    {
        self.clear();
        for (body, bounds) in bodies {
            self.insert(body, &bounds);
        }
    }

    pub fn clear(&mut self) {
        for cell in &mut self.cells {
            cell.clear();
        }
        self.pairs.clear();
        self.seen.clear();
    }

    /// Emit every unordered pair of bodies sharing a cell, exactly once.
    pub fn generate_potential_pairs(&mut self) -> &[CollisionPair<B>] {
        self.pairs.clear();
        self.seen.clear();

        for cell in &self.cells {
            if cell.len() < 2 {
                continue;
            }
            for i in 0..cell.len() {
                for j in (i + 1)..cell.len() {
                    let pair = CollisionPair::new(cell[i], cell[j]);
                    if self.seen.insert(pair) {
                        self.pairs.push(pair);
                    }
                }
            }
        }
        &self.pairs
    }

    /// Pairs produced by the last `generate_potential_pairs` call.
    pub fn potential_pairs(&self) -> &[CollisionPair<B>] {
        &self.pairs
    }

    pub fn stats(&self) -> GridStats {
        let mut stats = GridStats {
            total_cells: self.cells.len(),
            potential_pairs: self.pairs.len(),
            ..GridStats::default()
        };
        for cell in &self.cells {
            if cell.is_empty() {
                continue;
            }
            stats.occupied_cells += 1;
            stats.max_objects_per_cell = stats.max_objects_per_cell.max(cell.len());
            stats.total_objects += cell.len();
        }
        if stats.occupied_cells > 0 {
            stats.average_objects_per_occupied_cell =
                stats.total_objects as f32 / stats.occupied_cells as f32;
        }
        stats
    }

    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    pub fn world_min(&self) -> Vec2 {
        self.world_min
    }

    pub fn world_max(&self) -> Vec2 {
        self.world_max
    }

    pub fn width(&self) -> i32 {
        self.width
    }

    pub fn height(&self) -> i32 {
        self.height
    }
}
