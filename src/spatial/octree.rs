use glam::Vec3;
use slotmap::{SecondaryMap, SlotMap};
use smallvec::SmallVec;

use super::{ObjectHandle, SpatialConfig, SpatialContainer, SpatialObject, SpatialQuery};
use crate::geometry::Aabb;
use crate::spatial::ConfigError;

const NUM_CHILDREN: usize = 8;
const NO_NODE: u32 = u32::MAX;

struct Node {
    bounds: Aabb,
    depth: u32,
    parent: u32,
    children: [u32; NUM_CHILDREN],
    objects: SmallVec<[ObjectHandle; 8]>,
}

impl Node {
    fn new(bounds: Aabb, depth: u32, parent: u32) -> Self {
        Self {
            bounds,
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

/// Loose octree: node bounds are expanded by the configured looseness so
/// objects sink into a single child more often. The root grows to enclose
/// escaping objects and sheds degenerate levels after removals.
///
/// Interior nodes live in an index arena; every node knows its parent, so
/// merges after removal walk up without searching.
pub struct LooseOctree<T: SpatialObject> {
    config: SpatialConfig,
    objects: SlotMap<ObjectHandle, T>,
    /// Node currently holding each object.
    locations: SecondaryMap<ObjectHandle, u32>,
    nodes: Vec<Node>,
    free_nodes: Vec<u32>,
    root: u32,
}

impl<T: SpatialObject> LooseOctree<T> {
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

    /// Bounds of the current root, if any object has been inserted.
    pub fn root_bounds(&self) -> Option<Aabb> {
        (self.root != NO_NODE).then(|| self.nodes[self.root as usize].bounds)
    }

    fn alloc_node(&mut self, bounds: Aabb, depth: u32, parent: u32) -> u32 {
        if let Some(index) = self.free_nodes.pop() {
            self.nodes[index as usize] = Node::new(bounds, depth, parent);
            index
        } else {
            self.nodes.push(Node::new(bounds, depth, parent));
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

    fn child_index(bounds: &Aabb, point: Vec3) -> usize {
        let center = bounds.center();
        let mut index = 0;
        if point.x >= center.x {
            index |= 1;
        }
        if point.y >= center.y {
            index |= 2;
        }
        if point.z >= center.z {
            index |= 4;
        }
        index
    }

    fn child_bounds(bounds: &Aabb, index: usize) -> Aabb {
        let half = bounds.extent() * 0.5;
        let sign = Vec3::new(
            if index & 1 != 0 { 1.0 } else { -1.0 },
            if index & 2 != 0 { 1.0 } else { -1.0 },
            if index & 4 != 0 { 1.0 } else { -1.0 },
        );
        Aabb::from_center_extent(bounds.center() + sign * half, half)
    }

    fn ensure_child(&mut self, node: u32, index: usize) -> u32 {
        let existing = self.nodes[node as usize].children[index];
        if existing != NO_NODE {
            return existing;
        }
        let bounds = Self::child_bounds(&self.nodes[node as usize].bounds, index);
        let depth = self.nodes[node as usize].depth + 1;
        let child = self.alloc_node(bounds, depth, node);
        self.nodes[node as usize].children[index] = child;
        child
    }

    fn insert_handle(&mut self, handle: ObjectHandle, bounds: Aabb) {
        if self.root == NO_NODE {
            let extent = bounds.extent() * self.config.looseness;
            let root_bounds = Aabb::from_center_extent(bounds.center(), extent);
            self.root = self.alloc_node(root_bounds, 0, NO_NODE);
        } else if !self.nodes[self.root as usize].bounds.contains_aabb(&bounds) {
            self.grow(&bounds);
        }
        self.insert_into(self.root, handle, bounds);
    }

    fn insert_into(&mut self, node: u32, handle: ObjectHandle, bounds: Aabb) {
        let node_bounds = self.nodes[node as usize].bounds;
        let depth = self.nodes[node as usize].depth;

        // Too deep or too small to split further: the object stays here.
        if depth >= self.config.max_depth
            || node_bounds.size().min_element() <= self.config.min_node_size
        {
            self.place(node, handle);
            return;
        }

        let index = Self::child_index(&node_bounds, bounds.center());
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
        if self.nodes[child as usize].bounds.contains_aabb(&bounds) {
            self.insert_into(child, handle, bounds);
        } else {
            // Straddles the child boundary; it stays at this level.
            self.place(node, handle);
        }
    }

    fn split(&mut self, node: u32) {
        let node_bounds = self.nodes[node as usize].bounds;
        let handles = std::mem::take(&mut self.nodes[node as usize].objects);
        for handle in handles {
            let bounds = self.objects[handle].bounds();
            let index = Self::child_index(&node_bounds, bounds.center());
            let child = self.ensure_child(node, index);
            if self.nodes[child as usize].bounds.contains_aabb(&bounds) {
                self.nodes[child as usize].objects.push(handle);
                self.locations.insert(handle, child);
            } else {
                self.nodes[node as usize].objects.push(handle);
            }
        }
    }

    /// Re-root with bounds covering both the old tree and the escapee.
    fn grow(&mut self, bounds: &Aabb) {
        let old_root = self.root;
        let union = self.nodes[old_root as usize].bounds.union(bounds);
        let new_bounds =
            Aabb::from_center_extent(union.center(), union.extent() * self.config.looseness);

        let index = Self::child_index(&new_bounds, self.nodes[old_root as usize].bounds.center());
        let new_root = self.alloc_node(new_bounds, 0, NO_NODE);
        self.nodes[new_root as usize].children[index] = old_root;
        self.nodes[old_root as usize].parent = new_root;
        self.root = new_root;
        self.refresh_depths(old_root, 1);
        log::trace!("octree root grew to {:?}", new_bounds);
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

    /// Move every object in the subtree into `out` and free its nodes.
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

    /// Collapse the children into `node` when the whole subtree fits the
    /// per-node budget again.
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
        // log base 8
        ((buckets as f32).log2() / 3.0) as usize + 1
    }

    fn should_shrink(&self) -> bool {
        self.root != NO_NODE
            && !self.nodes[self.root as usize].is_leaf()
            && self.max_depth() < self.optimal_depth() / 2
    }

    /// Strip degenerate roots: a root with no objects of its own and exactly
    /// one live child hands the root role to that child.
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

    fn query_node<Q: SpatialQuery<T>>(
        &self,
        node: u32,
        query: &Q,
        results: &mut Vec<ObjectHandle>,
    ) {
        if query.is_complete() {
            return;
        }
        let n = &self.nodes[node as usize];
        if !query.should_traverse(&n.bounds) {
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
                self.query_node(child, query, results);
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
        draw(&n.bounds);
        for &child in &n.children {
            if child != NO_NODE {
                self.draw_node(child, draw);
            }
        }
    }
}

impl<T: SpatialObject> SpatialContainer<T> for LooseOctree<T> {
    fn insert(&mut self, object: T) -> ObjectHandle {
        let bounds = object.bounds();
        let handle = self.objects.insert(object);
        self.insert_handle(handle, bounds);
        handle
    }

    fn remove(&mut self, handle: ObjectHandle) -> Option<T> {
        let node = self.locations.remove(handle)?;
        let list = &mut self.nodes[node as usize].objects;
        if let Some(position) = list.iter().position(|&h| h == handle) {
            list.swap_remove(position);
        }
        let object = self.objects.remove(handle);

        // Merge opportunities propagate up from the removal point.
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
        let bounds = self.objects[handle].bounds();
        self.insert_handle(handle, bounds);
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
            self.query_node(self.root, query, results);
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

        let entries: Vec<(ObjectHandle, Aabb)> = self
            .objects
            .iter()
            .map(|(handle, object)| (handle, object.bounds()))
            .collect();
        for (handle, bounds) in entries {
            self.insert_handle(handle, bounds);
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
