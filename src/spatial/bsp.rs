use glam::Vec3;
use slotmap::{SecondaryMap, SlotMap};
use smallvec::SmallVec;

use super::{ObjectHandle, SpatialConfig, SpatialContainer, SpatialObject, SpatialQuery};
use crate::geometry::{Aabb, Plane, PlaneSide};
use crate::spatial::ConfigError;

const NO_NODE: u32 = u32::MAX;

struct Node {
    bounds: Aabb,
    /// Set once the node has split.
    plane: Option<Plane>,
    front: u32,
    back: u32,
    objects: SmallVec<[ObjectHandle; 8]>,
}

impl Node {
    fn new(bounds: Aabb) -> Self {
        Self {
            bounds,
            plane: None,
            front: NO_NODE,
            back: NO_NODE,
            objects: SmallVec::new(),
        }
    }

    fn is_leaf(&self) -> bool {
        self.front == NO_NODE && self.back == NO_NODE
    }
}

/// Binary space partitioning tree over axis-orthogonal planes.
///
/// Leaves split once they exceed the configured object budget; the split
/// plane is orthogonal to the node's largest extent (ties x > y > z) and
/// passes through the median of the contained objects' centers, which keeps
/// rebuilt trees balanced even on skewed distributions. Objects straddling
/// the plane stay in the interior node.
pub struct BspTree<T: SpatialObject> {
    config: SpatialConfig,
    objects: SlotMap<ObjectHandle, T>,
    locations: SecondaryMap<ObjectHandle, u32>,
    nodes: Vec<Node>,
    free_nodes: Vec<u32>,
    root: u32,
}

impl<T: SpatialObject> BspTree<T> {
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

    /// Fraction of partitioned objects living in the front subtree of the
    /// root; 0.5 when the root has not split.
    pub fn balance(&self) -> f32 {
        if self.root == NO_NODE || self.nodes[self.root as usize].is_leaf() {
            return 0.5;
        }
        let front = self.count_objects(self.nodes[self.root as usize].front);
        let total = front + self.count_objects(self.nodes[self.root as usize].back);
        if total == 0 {
            0.5
        } else {
            front as f32 / total as f32
        }
    }

    fn alloc_node(&mut self, bounds: Aabb) -> u32 {
        if let Some(index) = self.free_nodes.pop() {
            self.nodes[index as usize] = Node::new(bounds);
            index
        } else {
            self.nodes.push(Node::new(bounds));
            (self.nodes.len() - 1) as u32
        }
    }

    fn place(&mut self, node: u32, handle: ObjectHandle) {
        self.nodes[node as usize].objects.push(handle);
        self.locations.insert(handle, node);
    }

    fn insert_handle(&mut self, handle: ObjectHandle, bounds: Aabb) {
        if self.root == NO_NODE {
            self.root = self.alloc_node(bounds);
        } else {
            self.nodes[self.root as usize].bounds.extend(&bounds);
        }
        self.insert_into(self.root, handle, bounds);
    }

    fn insert_into(&mut self, node: u32, handle: ObjectHandle, bounds: Aabb) {
        if self.nodes[node as usize].is_leaf() {
            if self.nodes[node as usize].objects.len()
                < self.config.max_triangles_per_leaf as usize
            {
                self.place(node, handle);
                return;
            }
            self.split(node);
        }

        let plane = self.nodes[node as usize]
            .plane
            .expect("interior node always carries a split plane");
        match plane.side_of_aabb(&bounds) {
            PlaneSide::Front => {
                let front = self.nodes[node as usize].front;
                // Child bounds track late arrivals so pruning stays sound.
                self.nodes[front as usize].bounds.extend(&bounds);
                self.insert_into(front, handle, bounds)
            }
            PlaneSide::Back => {
                let back = self.nodes[node as usize].back;
                self.nodes[back as usize].bounds.extend(&bounds);
                self.insert_into(back, handle, bounds)
            }
            PlaneSide::On => self.place(node, handle),
        }
    }

    fn split(&mut self, node: u32) {
        let bounds = self.nodes[node as usize].bounds;
        let handles = std::mem::take(&mut self.nodes[node as usize].objects);

        // Axis of largest extent, ties resolved x over y over z.
        let extent = bounds.extent();
        let axis = if extent.x >= extent.y && extent.x >= extent.z {
            0
        } else if extent.y >= extent.z {
            1
        } else {
            2
        };

        // Median of the object centers keeps the two halves even.
        let mut centers: Vec<f32> = handles
            .iter()
            .map(|&h| self.objects[h].bounds().center()[axis])
            .collect();
        let position = if centers.is_empty() {
            bounds.center()[axis]
        } else {
            let mid = centers.len() / 2;
            *centers
                .select_nth_unstable_by(mid, f32::total_cmp)
                .1
        };

        let mut normal = Vec3::ZERO;
        normal[axis] = 1.0;
        let plane = Plane::new(normal, -position);

        let mut front_bounds = bounds;
        front_bounds.min[axis] = position;
        let mut back_bounds = bounds;
        back_bounds.max[axis] = position;

        let front = self.alloc_node(front_bounds);
        let back = self.alloc_node(back_bounds);
        let n = &mut self.nodes[node as usize];
        n.plane = Some(plane);
        n.front = front;
        n.back = back;

        for handle in handles {
            let object_bounds = self.objects[handle].bounds();
            match plane.side_of_aabb(&object_bounds) {
                PlaneSide::Front => {
                    self.nodes[front as usize].objects.push(handle);
                    self.locations.insert(handle, front);
                }
                PlaneSide::Back => {
                    self.nodes[back as usize].objects.push(handle);
                    self.locations.insert(handle, back);
                }
                PlaneSide::On => self.nodes[node as usize].objects.push(handle),
            }
        }
    }

    fn count_objects(&self, node: u32) -> usize {
        if node == NO_NODE {
            return 0;
        }
        let n = &self.nodes[node as usize];
        n.objects.len() + self.count_objects(n.front) + self.count_objects(n.back)
    }

    fn query_node<Q: SpatialQuery<T>>(
        &self,
        node: u32,
        query: &Q,
        results: &mut Vec<ObjectHandle>,
    ) {
        if node == NO_NODE || query.is_complete() {
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
        self.query_node(n.front, query, results);
        self.query_node(n.back, query, results);
    }

    fn node_depths(&self, node: u32) -> usize {
        if node == NO_NODE {
            return 0;
        }
        let n = &self.nodes[node as usize];
        1 + self.node_depths(n.front).max(self.node_depths(n.back))
    }

    fn draw_node(&self, node: u32, draw: &mut dyn FnMut(&Aabb)) {
        if node == NO_NODE {
            return;
        }
        let n = &self.nodes[node as usize];
        draw(&n.bounds);
        self.draw_node(n.front, draw);
        self.draw_node(n.back, draw);
    }
}

impl<T: SpatialObject> SpatialContainer<T> for BspTree<T> {
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

        // The last removal tears the empty structure down so an emptied tree
        // does not keep its split skeleton around.
        if self.objects.is_empty() {
            self.nodes.clear();
            self.free_nodes.clear();
            self.locations.clear();
            self.root = NO_NODE;
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
        self.query_node(self.root, query, results);
    }

    fn optimize(&mut self) {
        if self.objects.len() < 100 {
            return;
        }
        let balance = self.balance();
        if !(0.3..=0.7).contains(&balance) {
            log::debug!("bsp balance {balance:.2} out of range, rebuilding");
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
        self.node_depths(self.root)
    }

    fn debug_draw(&self, draw: &mut dyn FnMut(&Aabb)) {
        self.draw_node(self.root, draw);
    }
}
