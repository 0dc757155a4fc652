use glam::Vec2;
use slotmap::{SecondaryMap, SlotMap};
use smallvec::SmallVec;

use super::{
    ObjectHandle, ProjectionPlane, SpatialConfig, SpatialContainer, SpatialObject, SpatialQuery,
};
use crate::geometry::Aabb;
use crate::spatial::ConfigError;

const NUM_CHILDREN: usize = 4;
const NO_NODE: u32 = u32::MAX;

/// Planar bounds in center/half-extent form.
#[derive(Debug, Clone, Copy)]
struct Rect {
    center: Vec2,
    extent: Vec2,
}

impl Rect {
    fn from_aabb(bounds: &Aabb, plane: ProjectionPlane) -> Self {
        Self {
            center: plane.project(bounds.center()),
            extent: plane.project(bounds.max - bounds.center()),
        }
    }

    fn min(&self) -> Vec2 {
        self.center - self.extent
    }

    fn max(&self) -> Vec2 {
        self.center + self.extent
    }

    fn union(&self, other: &Rect) -> Rect {
        let min = self.min().min(other.min());
        let max = self.max().max(other.max());
        Rect {
            center: (min + max) * 0.5,
            extent: (max - min) * 0.5,
        }
    }

    fn contains_rect(&self, other: &Rect) -> bool {
        let min = self.min();
        let max = self.max();
        let other_min = other.min();
        let other_max = other.max();
        min.x <= other_min.x && min.y <= other_min.y && max.x >= other_max.x && max.y >= other_max.y
    }

    /// Smallest full edge length.
    fn min_size(&self) -> f32 {
        2.0 * self.extent.min_element()
    }

    fn lift(&self, plane: ProjectionPlane, w_min: f32, w_max: f32) -> Aabb {
        plane.lift(self.min(), self.max(), w_min, w_max)
    }
}

struct Node {
    rect: Rect,
    depth: u32,
    parent: u32,
    children: [u32; NUM_CHILDREN],
    objects: SmallVec<[ObjectHandle; 8]>,
}

impl Node {
    fn new(rect: Rect, depth: u32, parent: u32) -> Self {
        Self {
            rect,
            depth,
            parent,
            children: [NO_NODE; NUM_CHILDREN],
            objects: SmallVec::new(),
        }
    }

    fn is_leaf(&self) -> bool {
        self.children.iter().all(|&c| c == NO_NODE)
    }
}

/// Quadtree over a configurable plane (XZ by default).
///
/// Objects are indexed by their projected bounds; the remaining axis is
/// reconstructed per query — point queries get a thin slab around the query
/// point, volume queries the query's own range, everything else the full
/// range.
pub struct Quadtree<T: SpatialObject> {
    config: SpatialConfig,
    objects: SlotMap<ObjectHandle, T>,
    locations: SecondaryMap<ObjectHandle, u32>,
    nodes: Vec<Node>,
    free_nodes: Vec<u32>,
    root: u32,
}

impl<T: SpatialObject> Quadtree<T> {
    pub fn new(config: SpatialConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            objects: SlotMap::with_key(),
            locations: SecondaryMap::new(),
            nodes: Vec::new(),
            free_nodes: Vec::new(),
            root: NO_NODE,
        })
    }

    pub fn config(&self) -> &SpatialConfig {
        &self.config
    }

    fn alloc_node(&mut self, rect: Rect, depth: u32, parent: u32) -> u32 {
        if let Some(index) = self.free_nodes.pop() {
            self.nodes[index as usize] = Node::new(rect, depth, parent);
            index
        } else {
            self.nodes.push(Node::new(rect, depth, parent));
            (self.nodes.len() - 1) as u32
        }
    }

    fn release_node(&mut self, index: u32) {
        self.nodes[index as usize].objects.clear();
        self.nodes[index as usize].children = [NO_NODE; NUM_CHILDREN];
        self.free_nodes.push(index);
    }

    fn place(&mut self, node: u32, handle: ObjectHandle) {
        self.nodes[node as usize].objects.push(handle);
        self.locations.insert(handle, node);
    }

    fn child_index(rect: &Rect, point: Vec2) -> usize {
        let mut index = 0;
        if point.x >= rect.center.x {
            index |= 1;
        }
        if point.y >= rect.center.y {
            index |= 2;
        }
        index
    }

    fn child_rect(rect: &Rect, index: usize) -> Rect {
        let half = rect.extent * 0.5;
        let sign = Vec2::new(
            if index & 1 != 0 { 1.0 } else { -1.0 },
            if index & 2 != 0 { 1.0 } else { -1.0 },
        );
        Rect {
            center: rect.center + sign * half,
            extent: half,
        }
    }

    fn ensure_child(&mut self, node: u32, index: usize) -> u32 {
        let existing = self.nodes[node as usize].children[index];
        if existing != NO_NODE {
            return existing;
        }
        let rect = Self::child_rect(&self.nodes[node as usize].rect, index);
        let depth = self.nodes[node as usize].depth + 1;
        let child = self.alloc_node(rect, depth, node);
        self.nodes[node as usize].children[index] = child;
        child
    }

    fn insert_handle(&mut self, handle: ObjectHandle, rect: Rect) {
        if self.root == NO_NODE {
            self.root = self.alloc_node(rect, 0, NO_NODE);
        } else {
            // The root's planar bounds grow in place to cover new objects.
            self.nodes[self.root as usize].rect =
                self.nodes[self.root as usize].rect.union(&rect);
        }
        self.insert_into(self.root, handle, rect);
    }

    fn insert_into(&mut self, node: u32, handle: ObjectHandle, rect: Rect) {
        let node_rect = self.nodes[node as usize].rect;
        let depth = self.nodes[node as usize].depth;

        if depth >= self.config.max_depth || node_rect.min_size() <= self.config.min_node_size {
            self.place(node, handle);
            return;
        }

        let index = Self::child_index(&node_rect, rect.center);
        if self.nodes[node as usize].is_leaf() {
            if self.nodes[node as usize].objects.len()
                < self.config.max_objects_per_node as usize
            {
                self.place(node, handle);
                return;
            }
            self.split(node);
        }

        let child = self.ensure_child(node, index);
        if self.nodes[child as usize].rect.contains_rect(&rect) {
            self.insert_into(child, handle, rect);
        } else {
            self.place(node, handle);
        }
    }

    fn split(&mut self, node: u32) {
        let node_rect = self.nodes[node as usize].rect;
        let plane = self.config.projection_plane;
        let handles = std::mem::take(&mut self.nodes[node as usize].objects);
        for handle in handles {
            let rect = Rect::from_aabb(&self.objects[handle].bounds(), plane);
            let index = Self::child_index(&node_rect, rect.center);
            let child = self.ensure_child(node, index);
            if self.nodes[child as usize].rect.contains_rect(&rect) {
                self.nodes[child as usize].objects.push(handle);
                self.locations.insert(handle, child);
            } else {
                self.nodes[node as usize].objects.push(handle);
            }
        }
    }

    fn subtree_object_count(&self, node: u32) -> usize {
        let n = &self.nodes[node as usize];
        let mut count = n.objects.len();
        for &child in &n.children {
            if child != NO_NODE {
                count += self.subtree_object_count(child);
            }
        }
        count
    }

    fn drain_subtree(&mut self, node: u32, out: &mut Vec<ObjectHandle>) {
        let children = self.nodes[node as usize].children;
        out.extend(self.nodes[node as usize].objects.drain(..));
        for child in children {
            if child != NO_NODE {
                self.drain_subtree(child, out);
            }
        }
        self.release_node(node);
    }

    fn try_merge(&mut self, node: u32) {
        if self.nodes[node as usize].is_leaf() {
            return;
        }
        if self.subtree_object_count(node) > self.config.max_objects_per_node as usize {
            return;
        }

        let mut collected = Vec::new();
        let children = std::mem::replace(
            &mut self.nodes[node as usize].children,
            [NO_NODE; NUM_CHILDREN],
        );
        for child in children {
            if child != NO_NODE {
                self.drain_subtree(child, &mut collected);
            }
        }
        for handle in collected {
            self.place(node, handle);
        }
    }

    fn optimal_depth(&self) -> usize {
        let per_node = self.config.max_objects_per_node.max(1) as usize;
        let buckets = (self.objects.len() / per_node).max(1);
        // log base 4
        ((buckets as f32).log2() / 2.0) as usize + 1
    }

    fn should_shrink(&self) -> bool {
        self.root != NO_NODE
            && !self.nodes[self.root as usize].is_leaf()
            && self.max_depth() < self.optimal_depth() / 2
    }

    fn shrink_tree(&mut self) {
        while self.root != NO_NODE {
            let root = &self.nodes[self.root as usize];
            if !root.objects.is_empty() {
                break;
            }
            let mut live = root.children.iter().filter(|&&c| c != NO_NODE);
            let (Some(&only), None) = (live.next(), live.next()) else {
                break;
            };
            let old_root = self.root;
            self.nodes[old_root as usize].children = [NO_NODE; NUM_CHILDREN];
            self.release_node(old_root);
            self.nodes[only as usize].parent = NO_NODE;
            self.root = only;
            self.refresh_depths(only, 0);
        }
    }

    fn refresh_depths(&mut self, node: u32, depth: u32) {
        self.nodes[node as usize].depth = depth;
        let children = self.nodes[node as usize].children;
        for child in children {
            if child != NO_NODE {
                self.refresh_depths(child, depth + 1);
            }
        }
    }

    /// Range on the unpartitioned axis a query's node tests should cover.
    fn slab_range<Q: SpatialQuery<T>>(&self, query: &Q) -> (f32, f32) {
        let plane = self.config.projection_plane;
        match query.volume_hint() {
            Some(hint) => {
                let lo = plane.w(hint.min);
                let hi = plane.w(hint.max);
                if lo == hi {
                    // Point probe: a thin slab around the query point.
                    (lo - self.config.min_node_size, hi + self.config.min_node_size)
                } else {
                    (lo, hi)
                }
            }
            None => (f32::MIN, f32::MAX),
        }
    }

    fn query_node<Q: SpatialQuery<T>>(
        &self,
        node: u32,
        query: &Q,
        slab: (f32, f32),
        results: &mut Vec<ObjectHandle>,
    ) {
        if query.is_complete() {
            return;
        }
        let n = &self.nodes[node as usize];
        let bounds = n.rect.lift(self.config.projection_plane, slab.0, slab.1);
        if !query.should_traverse(&bounds) {
            return;
        }
        for &handle in &n.objects {
            if query.is_complete() {
                return;
            }
            if query.should_accept(&self.objects[handle]) {
                results.push(handle);
            }
        }
        for &child in &n.children {
            if child != NO_NODE {
                self.query_node(child, query, slab, results);
            }
        }
    }

    fn node_depths(&self, node: u32) -> usize {
        let n = &self.nodes[node as usize];
        let mut deepest = 0;
        for &child in &n.children {
            if child != NO_NODE {
                deepest = deepest.max(self.node_depths(child));
            }
        }
        1 + deepest
    }

    fn draw_node(&self, node: u32, draw: &mut dyn FnMut(&Aabb)) {
        let n = &self.nodes[node as usize];
        // Arbitrary slab for visualization.
        draw(&n.rect.lift(self.config.projection_plane, -1.0, 1.0));
        for &child in &n.children {
            if child != NO_NODE {
                self.draw_node(child, draw);
            }
        }
    }
}

impl<T: SpatialObject> SpatialContainer<T> for Quadtree<T> {
    fn insert(&mut self, object: T) -> ObjectHandle {
        let rect = Rect::from_aabb(&object.bounds(), self.config.projection_plane);
        let handle = self.objects.insert(object);
        self.insert_handle(handle, rect);
        handle
    }

    fn remove(&mut self, handle: ObjectHandle) -> Option<T> {
        let node = self.locations.remove(handle)?;
        let list = &mut self.nodes[node as usize].objects;
        if let Some(position) = list.iter().position(|&h| h == handle) {
            list.swap_remove(position);
        }
        let object = self.objects.remove(handle);

        let mut current = node;
        while current != NO_NODE {
            self.try_merge(current);
            current = self.nodes[current as usize].parent;
        }
        if !self.objects.is_empty() && self.should_shrink() {
            self.shrink_tree();
        }
        object
    }

    fn update(&mut self, handle: ObjectHandle) {
        let Some(&node) = self.locations.get(handle) else {
            return;
        };
        let list = &mut self.nodes[node as usize].objects;
        if let Some(position) = list.iter().position(|&h| h == handle) {
            list.swap_remove(position);
        }
        let rect = Rect::from_aabb(&self.objects[handle].bounds(), self.config.projection_plane);
        self.insert_handle(handle, rect);
    }

    fn clear(&mut self) {
        self.objects.clear();
        self.locations.clear();
        self.nodes.clear();
        self.free_nodes.clear();
        self.root = NO_NODE;
    }

    fn get(&self, handle: ObjectHandle) -> Option<&T> {
        self.objects.get(handle)
    }

    fn get_mut(&mut self, handle: ObjectHandle) -> Option<&mut T> {
        self.objects.get_mut(handle)
    }

    fn query<Q: SpatialQuery<T>>(&self, query: &Q, results: &mut Vec<ObjectHandle>) {
        if self.root != NO_NODE {
            let slab = self.slab_range(query);
            self.query_node(self.root, query, slab, results);
        }
    }

    fn optimize(&mut self) {
        if self.objects.len() < 100 {
            return;
        }
        if self.max_depth() > 2 * self.optimal_depth() {
            self.rebuild();
        }
    }

    fn rebuild(&mut self) {
        if self.objects.is_empty() {
            return;
        }
        self.nodes.clear();
        self.free_nodes.clear();
        self.locations.clear();
        self.root = NO_NODE;

        let plane = self.config.projection_plane;
        let entries: Vec<(ObjectHandle, Rect)> = self
            .objects
            .iter()
            .map(|(handle, object)| (handle, Rect::from_aabb(&object.bounds(), plane)))
            .collect();
        for (handle, rect) in entries {
            self.insert_handle(handle, rect);
        }
    }

    fn object_count(&self) -> usize {
        self.objects.len()
    }

    fn node_count(&self) -> usize {
        if self.root == NO_NODE {
            0
        } else {
            self.nodes.len() - self.free_nodes.len()
        }
    }

    fn max_depth(&self) -> usize {
        if self.root == NO_NODE {
            0
        } else {
            self.node_depths(self.root)
        }
    }

    fn debug_draw(&self, draw: &mut dyn FnMut(&Aabb)) {
        if self.root != NO_NODE {
            self.draw_node(self.root, draw);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spatial::testutil::{TestBox, brute_force_volume, sorted};
    use crate::spatial::{PointQuery, VolumeQuery};
    use glam::Vec3;

    fn world_query() -> VolumeQuery {
        VolumeQuery::new(Aabb::new(Vec3::splat(-1000.0), Vec3::splat(1000.0)))
    }

    #[test]
    fn test_round_trip() {
        let mut tree = Quadtree::new(SpatialConfig::default()).unwrap();
        let mut handles = Vec::new();
        for i in 0..64 {
            let center = Vec3::new((i % 8) as f32 * 3.0, 0.0, (i / 8) as f32 * 3.0);
            handles.push(tree.insert(TestBox::new(center, 0.5, i)));
        }
        assert_eq!(tree.object_count(), 64);

        let mut results = Vec::new();
        tree.query(&world_query(), &mut results);
        assert_eq!(sorted(results), sorted(handles.clone()));

        for handle in handles {
            assert!(tree.remove(handle).is_some());
        }
        assert_eq!(tree.object_count(), 0);
        assert!(tree.node_count() <= 1);
    }

    #[test]
    fn test_volume_query_matches_oracle() {
        let mut config = SpatialConfig::default();
        config.max_objects_per_node = 4;
        config.min_node_size = 0.1;
        let mut tree = Quadtree::new(config).unwrap();

        let mut handles = Vec::new();
        for x in 0..12 {
            for z in 0..12 {
                let center = Vec3::new(x as f32 * 2.0, 0.0, z as f32 * 2.0);
                handles.push(tree.insert(TestBox::new(center, 0.4, 0)));
            }
        }

        let volume = Aabb::new(Vec3::new(3.0, -1.0, 3.0), Vec3::new(12.0, 1.0, 12.0));
        let mut results = Vec::new();
        tree.query(&VolumeQuery::new(volume), &mut results);
        let expected = brute_force_volume(&tree, &handles, &volume);
        assert_eq!(sorted(results), sorted(expected));
    }

    #[test]
    fn test_point_query_uses_slab() {
        let mut tree = Quadtree::new(SpatialConfig::default()).unwrap();
        let low = tree.insert(TestBox::new(Vec3::new(5.0, 0.0, 5.0), 0.5, 0));
        let high = tree.insert(TestBox::new(Vec3::new(5.0, 50.0, 5.0), 0.5, 1));

        // Both objects project to the same planar cell; only the one whose
        // y-range holds the probe is accepted.
        let mut results = Vec::new();
        tree.query(&PointQuery::new(Vec3::new(5.0, 0.0, 5.0)), &mut results);
        assert_eq!(results, vec![low]);

        results.clear();
        tree.query(&PointQuery::new(Vec3::new(5.0, 50.0, 5.0)), &mut results);
        assert_eq!(results, vec![high]);
    }

    #[test]
    fn test_tall_objects_found_regardless_of_height() {
        let mut tree = Quadtree::new(SpatialConfig::default()).unwrap();
        let handle = tree.insert(TestBox::new(Vec3::new(2.0, 200.0, 2.0), 0.5, 0));

        // A volume query whose y-range matches the object.
        let volume = Aabb::new(Vec3::new(0.0, 195.0, 0.0), Vec3::new(4.0, 205.0, 4.0));
        let mut results = Vec::new();
        tree.query(&VolumeQuery::new(volume), &mut results);
        assert_eq!(results, vec![handle]);

        // Same planar footprint but a disjoint y-range.
        let disjoint = Aabb::new(Vec3::new(0.0, 0.0, 0.0), Vec3::new(4.0, 5.0, 4.0));
        results.clear();
        tree.query(&VolumeQuery::new(disjoint), &mut results);
        assert!(results.is_empty());
    }

    #[test]
    fn test_update_moves_object() {
        let mut tree = Quadtree::new(SpatialConfig::default()).unwrap();
        let handle = tree.insert(TestBox::new(Vec3::ZERO, 0.5, 0));
        tree.get_mut(handle).unwrap().bounds =
            Aabb::from_center_extent(Vec3::new(30.0, 0.0, 30.0), Vec3::splat(0.5));
        tree.update(handle);

        let probe = Aabb::from_center_extent(Vec3::new(30.0, 0.0, 30.0), Vec3::splat(1.0));
        let mut results = Vec::new();
        tree.query(&VolumeQuery::new(probe), &mut results);
        assert_eq!(results, vec![handle]);
    }

    #[test]
    fn test_unknown_handle_is_noop() {
        let mut tree = Quadtree::new(SpatialConfig::default()).unwrap();
        let handle = tree.insert(TestBox::new(Vec3::ZERO, 0.5, 0));
        tree.remove(handle);
        assert!(tree.remove(handle).is_none());
        tree.update(handle);
        assert_eq!(tree.object_count(), 0);
    }
}
