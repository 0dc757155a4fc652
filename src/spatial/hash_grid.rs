use std::cell::RefCell;

use fxhash::{FxHashMap, FxHashSet};
use glam::Vec3;
use slotmap::{SecondaryMap, SlotMap};
use smallvec::SmallVec;

use super::{ObjectHandle, SpatialConfig, SpatialContainer, SpatialObject, SpatialQuery};
use crate::geometry::Aabb;
use crate::spatial::ConfigError;

/// Queries pad the scanned cell range by this fraction of the cell size.
const QUERY_PADDING: f32 = 0.1;

thread_local! {
    /// Per-query dedup set, reused across invocations on the same thread.
    static QUERY_SEEN: RefCell<FxHashSet<ObjectHandle>> = RefCell::new(FxHashSet::default());
}

/// Sparse uniform grid keyed by a linear cell index.
///
/// Cell coordinates wrap modulo the grid size, so bounds spanning more than
/// `grid_size` cells alias distant cells into one bucket; the exact bounds
/// check during queries keeps results correct. The grid size adapts to the
/// object count (16/32/64/128 per axis) and never drops below 16.
pub struct SpatialHashGrid<T: SpatialObject> {
    config: SpatialConfig,
    objects: SlotMap<ObjectHandle, T>,
    /// Cached cell set per object, for O(cells) removal.
    object_cells: SecondaryMap<ObjectHandle, SmallVec<[u64; 8]>>,
    cells: FxHashMap<u64, SmallVec<[ObjectHandle; 8]>>,
    total_bounds: Aabb,
    cell_size_inv: f32,
    grid_size: u64,
}

impl<T: SpatialObject> SpatialHashGrid<T> {
    pub fn new(config: SpatialConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            objects: SlotMap::with_key(),
            object_cells: SecondaryMap::new(),
            cells: FxHashMap::default(),
            total_bounds: Aabb::default(),
            cell_size_inv: 1.0 / config.cell_size,
            grid_size: 16,
        })
    }

    pub fn config(&self) -> &SpatialConfig {
        &self.config
    }

    pub fn grid_size(&self) -> u64 {
        self.grid_size
    }

    /// Union of all inserted object bounds (never shrinks on removal).
    pub fn total_bounds(&self) -> Aabb {
        self.total_bounds
    }

    /// Pre-size the internal maps ahead of a bulk insert to cut rehashing.
    pub fn reserve(&mut self, count: usize) {
        self.objects.reserve(count);
        // Objects overlap ~4 cells on average.
        self.cells.reserve(count * 4);
    }

    fn grid_size_for(count: usize) -> u64 {
        match count {
            0..100 => 16,
            100..1000 => 32,
            1000..10000 => 64,
            _ => 128,
        }
    }

    fn wrap(&self, coordinate: f32) -> u64 {
        let cell = (coordinate * self.cell_size_inv).floor() as i64;
        cell.rem_euclid(self.grid_size as i64) as u64
    }

    /// Linear indices of every cell the box overlaps; `padded` widens the
    /// range for queries to catch boundary sitters.
    fn cell_indices(&self, bounds: &Aabb, padded: bool, out: &mut SmallVec<[u64; 8]>) {
        let pad = if padded {
            self.config.cell_size * QUERY_PADDING
        } else {
            0.0
        };
        let min = bounds.min - Vec3::splat(pad);
        let max = bounds.max + Vec3::splat(pad);

        let g = self.grid_size;
        let lo = [self.wrap(min.x), self.wrap(min.y), self.wrap(min.z)];
        let mut hi = [self.wrap(max.x), self.wrap(max.y), self.wrap(max.z)];
        for axis in 0..3 {
            if hi[axis] < lo[axis] {
                hi[axis] += g;
            }
        }

        for z in lo[2]..=hi[2] {
            let z_base = (z % g) * g * g;
            for y in lo[1]..=hi[1] {
                let zy_base = z_base + (y % g) * g;
                for x in lo[0]..=hi[0] {
                    out.push(zy_base + (x % g));
                }
            }
        }
    }

    fn add_to_cells(&mut self, handle: ObjectHandle, indices: &SmallVec<[u64; 8]>) {
        for &index in indices {
            self.cells.entry(index).or_default().push(handle);
        }
    }

    fn remove_from_cells(&mut self, handle: ObjectHandle, indices: &[u64]) {
        for &index in indices {
            if let Some(cell) = self.cells.get_mut(&index) {
                if let Some(position) = cell.iter().position(|&h| h == handle) {
                    cell.swap_remove(position);
                }
                if cell.is_empty() {
                    self.cells.remove(&index);
                }
            }
        }
    }

    /// Drop every bucket and re-derive the cell sets under the current grid
    /// size.
    fn rebucket(&mut self) {
        self.cells.clear();
        self.object_cells.clear();
        let entries: Vec<(ObjectHandle, Aabb)> = self
            .objects
            .iter()
            .map(|(handle, object)| (handle, object.bounds()))
            .collect();
        for (handle, bounds) in entries {
            let mut indices = SmallVec::new();
            self.cell_indices(&bounds, false, &mut indices);
            self.add_to_cells(handle, &indices);
            self.object_cells.insert(handle, indices);
        }
    }

    fn query_volume<Q: SpatialQuery<T>>(
        &self,
        volume: &Aabb,
        query: &Q,
        results: &mut Vec<ObjectHandle>,
    ) {
        if !volume.intersects(&self.total_bounds) {
            return;
        }

        let mut indices = SmallVec::new();
        self.cell_indices(volume, true, &mut indices);

        QUERY_SEEN.with(|seen| {
            let mut seen = seen.borrow_mut();
            seen.clear();
            for index in indices {
                let Some(cell) = self.cells.get(&index) else {
                    continue;
                };
                for &handle in cell {
                    if query.is_complete() {
                        return;
                    }
                    if !seen.insert(handle) {
                        continue;
                    }
                    // Aliased buckets can hold distant objects; confirm the
                    // actual bounds before running the query predicate.
                    let object = &self.objects[handle];
                    if object.bounds().intersects(volume) && query.should_accept(object) {
                        results.push(handle);
                    }
                }
            }
        });
    }

    fn query_point<Q: SpatialQuery<T>>(
        &self,
        point: Vec3,
        query: &Q,
        results: &mut Vec<ObjectHandle>,
    ) {
        if !self.total_bounds.contains(point) {
            return;
        }

        let g = self.grid_size;
        let base = [self.wrap(point.x), self.wrap(point.y), self.wrap(point.z)];

        QUERY_SEEN.with(|seen| {
            let mut seen = seen.borrow_mut();
            seen.clear();
            // The cell holding the point plus its positive neighbors, where
            // larger objects registered under adjacent coordinates live.
            for offset in 0..8u64 {
                let x = (base[0] + (offset & 1)) % g;
                let y = (base[1] + ((offset >> 1) & 1)) % g;
                let z = (base[2] + ((offset >> 2) & 1)) % g;
                let index = x + y * g + z * g * g;

                let Some(cell) = self.cells.get(&index) else {
                    continue;
                };
                for &handle in cell {
                    if query.is_complete() {
                        return;
                    }
                    if seen.insert(handle) && query.should_accept(&self.objects[handle]) {
                        results.push(handle);
                    }
                }
            }
        });
    }
}

impl<T: SpatialObject> SpatialContainer<T> for SpatialHashGrid<T> {
    fn insert(&mut self, object: T) -> ObjectHandle {
        let bounds = object.bounds();
        let count = self.objects.len();

        // Re-evaluate the grid size only at power-of-two counts.
        let old_size = self.grid_size;
        if count == 0 || count & (count - 1) == 0 {
            self.grid_size = Self::grid_size_for(count);
        }

        if count == 0 {
            self.total_bounds = bounds;
        } else {
            self.total_bounds.extend(&bounds);
        }

        let handle = self.objects.insert(object);
        if old_size != self.grid_size && count > 0 {
            log::debug!(
                "hash grid resized {old_size} -> {} at {count} objects",
                self.grid_size
            );
            self.rebucket();
            return handle;
        }

        let mut indices = SmallVec::new();
        self.cell_indices(&bounds, false, &mut indices);
        self.add_to_cells(handle, &indices);
        self.object_cells.insert(handle, indices);
        handle
    }

    fn remove(&mut self, handle: ObjectHandle) -> Option<T> {
        let indices = self.object_cells.remove(handle)?;
        self.remove_from_cells(handle, &indices);
        self.objects.remove(handle)
    }

    fn update(&mut self, handle: ObjectHandle) {
        let Some(object) = self.objects.get(handle) else {
            return;
        };
        let bounds = object.bounds();

        let mut new_indices = SmallVec::new();
        self.cell_indices(&bounds, false, &mut new_indices);

        if let Some(old_indices) = self.object_cells.remove(handle) {
            self.remove_from_cells(handle, &old_indices);
        }
        self.total_bounds.extend(&bounds);
        self.add_to_cells(handle, &new_indices);
        self.object_cells.insert(handle, new_indices);
    }

    fn clear(&mut self) {
        self.objects.clear();
        self.object_cells.clear();
        self.cells.clear();
        self.total_bounds = Aabb::default();
    }

    fn get(&self, handle: ObjectHandle) -> Option<&T> {
        self.objects.get(handle)
    }

    fn get_mut(&mut self, handle: ObjectHandle) -> Option<&mut T> {
        self.objects.get_mut(handle)
    }

    fn query<Q: SpatialQuery<T>>(&self, query: &Q, results: &mut Vec<ObjectHandle>) {
        if self.objects.is_empty() {
            return;
        }
        match query.volume_hint() {
            Some(hint) if hint.min == hint.max => self.query_point(hint.min, query, results),
            Some(hint) => self.query_volume(&hint, query, results),
            None => {
                // No spatial footprint to plan with (rays, frusta): test the
                // object table directly, which also needs no dedup.
                for (handle, object) in self.objects.iter() {
                    if query.is_complete() {
                        break;
                    }
                    if query.should_accept(object) {
                        results.push(handle);
                    }
                }
            }
        }
    }

    fn optimize(&mut self) {
        // Nothing to do: the grid adapts as the object count crosses its
        // thresholds.
    }

    fn rebuild(&mut self) {
        self.rebucket();
    }

    fn object_count(&self) -> usize {
        self.objects.len()
    }

    fn node_count(&self) -> usize {
        self.cells.len()
    }

    fn max_depth(&self) -> usize {
        // Flat structure.
        1
    }

    fn debug_draw(&self, draw: &mut dyn FnMut(&Aabb)) {
        let size = self.config.cell_size;
        let g = self.grid_size;
        for &index in self.cells.keys() {
            let x = (index % g) as f32;
            let y = ((index / g) % g) as f32;
            let z = (index / (g * g)) as f32;
            let min = Vec3::new(x, y, z) * size;
            draw(&Aabb::new(min, min + Vec3::splat(size)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spatial::VolumeQuery;
    use crate::spatial::testutil::{TestBox, brute_force_volume, sorted};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn grid() -> SpatialHashGrid<TestBox> {
        SpatialHashGrid::new(SpatialConfig::default()).unwrap()
    }

    #[test]
    fn test_round_trip() {
        let mut grid = grid();
        let mut handles = Vec::new();
        for i in 0..50 {
            let center = Vec3::new((i % 10) as f32 * 4.0, ((i / 10) % 5) as f32 * 4.0, 0.0);
            handles.push(grid.insert(TestBox::new(center, 0.5, i)));
        }
        assert_eq!(grid.object_count(), 50);

        let world = grid.total_bounds();
        let mut results = Vec::new();
        grid.query(&VolumeQuery::new(world), &mut results);
        assert_eq!(sorted(results), sorted(handles.clone()));

        for handle in handles {
            assert!(grid.remove(handle).is_some());
        }
        assert_eq!(grid.object_count(), 0);
        assert_eq!(grid.node_count(), 0);
    }

    #[test]
    fn test_volume_query_matches_brute_force() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut grid = grid();
        grid.reserve(1000);
        let mut rng = StdRng::seed_from_u64(99);
        let handles: Vec<_> = (0..1000)
            .map(|i| {
                let center = Vec3::new(
                    rng.random_range(-100.0..100.0),
                    rng.random_range(-100.0..100.0),
                    rng.random_range(-100.0..100.0),
                );
                grid.insert(TestBox::new(center, rng.random_range(0.1..2.0), i))
            })
            .collect();

        let volume = Aabb::new(Vec3::ZERO, Vec3::splat(5.0));
        let mut results = Vec::new();
        grid.query(&VolumeQuery::new(volume), &mut results);
        let expected = brute_force_volume(&grid, &handles, &volume);
        assert_eq!(sorted(results), sorted(expected));
    }

    #[test]
    fn test_update_equivalent_to_remove_insert() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut updated = grid();
        let mut reinserted = grid();

        let mut pairs = Vec::new();
        for i in 0..200 {
            let center = Vec3::new(
                rng.random_range(-40.0..40.0),
                rng.random_range(-40.0..40.0),
                rng.random_range(-40.0..40.0),
            );
            let object = TestBox::new(center, 1.0, i);
            pairs.push((updated.insert(object.clone()), reinserted.insert(object)));
        }

        // Move half of the objects to new positions through both paths.
        for i in (0..pairs.len()).step_by(2) {
            let (a, b) = pairs[i];
            let target = Vec3::new(
                rng.random_range(-40.0..40.0),
                rng.random_range(-40.0..40.0),
                rng.random_range(-40.0..40.0),
            );
            let moved = TestBox::new(target, 1.0, i as i32);

            *updated.get_mut(a).unwrap() = moved.clone();
            updated.update(a);

            reinserted.remove(b);
            pairs[i].1 = reinserted.insert(moved);
        }

        // Every subsequent query yields identical result sets.
        for _ in 0..50 {
            let center = Vec3::new(
                rng.random_range(-45.0..45.0),
                rng.random_range(-45.0..45.0),
                rng.random_range(-45.0..45.0),
            );
            let volume = Aabb::from_center_extent(center, Vec3::splat(6.0));

            let mut from_updated = Vec::new();
            updated.query(&VolumeQuery::new(volume), &mut from_updated);
            let mut from_reinserted = Vec::new();
            reinserted.query(&VolumeQuery::new(volume), &mut from_reinserted);

            let tags = |grid: &SpatialHashGrid<TestBox>, handles: &[ObjectHandle]| {
                let mut tags: Vec<i32> =
                    handles.iter().map(|&h| grid.get(h).unwrap().tag).collect();
                tags.sort();
                tags
            };
            assert_eq!(tags(&updated, &from_updated), tags(&reinserted, &from_reinserted));
        }
    }

    #[test]
    fn test_grid_adapts_to_object_count() {
        let mut grid = grid();
        assert_eq!(grid.grid_size(), 16);
        for i in 0..200 {
            grid.insert(TestBox::new(Vec3::splat(i as f32), 0.5, i));
        }
        // Growth is throttled to power-of-two counts, so the switch lands at
        // the first power of two past the 100-object threshold.
        assert_eq!(grid.grid_size(), 32);

        let world = grid.total_bounds();
        let mut results = Vec::new();
        grid.query(&VolumeQuery::new(world), &mut results);
        assert_eq!(results.len(), 200);
    }

    #[test]
    fn test_straddling_object_reported_once() {
        let mut grid = grid();
        // Spans many cells in every axis.
        let big = grid.insert(TestBox::new(Vec3::ZERO, 25.0, 0));
        let volume = Aabb::new(Vec3::splat(-30.0), Vec3::splat(30.0));
        let mut results = Vec::new();
        grid.query(&VolumeQuery::new(volume), &mut results);
        assert_eq!(results, vec![big]);
    }

    #[test]
    fn test_point_query() {
        use crate::spatial::PointQuery;
        let mut grid = grid();
        let hit = grid.insert(TestBox::new(Vec3::new(5.0, 5.0, 5.0), 1.0, 0));
        grid.insert(TestBox::new(Vec3::new(50.0, 5.0, 5.0), 1.0, 1));

        let mut results = Vec::new();
        grid.query(&PointQuery::new(Vec3::new(5.5, 4.5, 5.0)), &mut results);
        assert_eq!(results, vec![hit]);

        // Outside the union of all bounds: nothing to scan.
        results.clear();
        grid.query(&PointQuery::new(Vec3::splat(500.0)), &mut results);
        assert!(results.is_empty());
    }

    #[test]
    fn test_unknown_handle_is_noop() {
        let mut grid = grid();
        let handle = grid.insert(TestBox::new(Vec3::ZERO, 0.5, 0));
        grid.remove(handle);
        assert!(grid.remove(handle).is_none());
        grid.update(handle);
        assert_eq!(grid.object_count(), 0);
    }
}
