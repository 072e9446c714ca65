//! Tracked scene instances
//!
//! The probe field owns one [`InstanceTracker`] holding every scene element
//! currently inside the detection area. Slots are generational so a stale
//! [`InstanceId`] never aliases a reused slot. Change notifications arrive
//! through an [`InstanceListener`] the renderer clones into its component
//! hooks; the tracker drains the queue once per update and turns them into
//! [`RegionChange`] records the cascades consume.
//!
//! An instance is static when its mesh is rigid and the component is flagged
//! static for rendering, textures and movement. Static geometry lands in the
//! static scene structure and invalidates probes on change; everything else
//! goes to the per-frame dynamic structure and only touches probes.

use std::collections::HashMap;
use std::sync::Arc;

use candela_math::DAABB;
use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{GiError, GiResult};
use crate::geometry::GiComponent;
use crate::mesh_bvh::{DynamicMeshBvh, MeshBvh, MeshBvhCache};

/// Generational handle to a tracker slot
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId {
    index: u32,
    generation: u32,
}

impl InstanceId {
    pub const fn null() -> Self {
        Self { index: u32::MAX, generation: 0 }
    }

    pub fn is_null(&self) -> bool {
        self.index == u32::MAX
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::null()
    }
}

/// What kind of scene element a slot tracks
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackedKind {
    Component,
    OcclusionMesh,
    /// Tracked for change accounting only, contributes no trace geometry
    Decal,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstanceEventKind {
    BoundariesChanged,
    TexturesChanged,
    ParentWorldChanged,
    LayerMaskChanged,
    Destroyed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InstanceEvent {
    /// Component identifier, [`GiComponent::id`]
    pub component: u64,
    pub kind: InstanceEventKind,
}

/// Thread-safe notification sink. Renderer-side hooks push events from
/// wherever components mutate; the tracker drains them during update.
#[derive(Clone, Default)]
pub struct InstanceListener {
    queue: Arc<Mutex<Vec<InstanceEvent>>>,
}

impl InstanceListener {
    pub fn notify(&self, event: InstanceEvent) {
        self.queue.lock().push(event);
    }

    fn drain(&self, out: &mut Vec<InstanceEvent>) {
        out.append(&mut self.queue.lock());
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }
}

/// Probe state adjustment a content change requires
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RegionChange {
    /// Static content appeared, vanished or moved: probes overlapping the
    /// region must retrace. `hard` also resets disabled probes.
    Invalidate { bounds: DAABB, hard: bool },
    /// Dynamic content passed through: probes in the region drop their
    /// dynamic-disable state but keep cached rays.
    Touch { bounds: DAABB },
}

/// True when the component may enter the static scene structure
pub fn is_component_static(component: &dyn GiComponent) -> bool {
    let rigid = component
        .mesh()
        .map(|mesh| mesh.weight_count == 0)
        .unwrap_or(true);
    rigid
        && component.render_static()
        && component.textures_static()
        && component.movement_stationary()
}

/// One tracked scene element
pub struct TrackedInstance {
    pub component: Arc<dyn GiComponent>,
    pub kind: TrackedKind,
    pub dynamic: bool,
    pub extents: DAABB,
    /// Shared tree for rigid meshes and occluders, owned by the cache
    pub mesh_bvh: Option<Arc<MeshBvh>>,
    /// Private refittable tree for skinned meshes
    pub dynamic_bvh: Option<DynamicMeshBvh>,
    geometry_id: Option<u64>,
    changed: bool,
    hard_changed: bool,
    marked: bool,
}

struct Slot {
    generation: u32,
    entry: Option<TrackedInstance>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceTrackerStats {
    pub tracked: usize,
    pub static_count: usize,
    pub dynamic_count: usize,
    pub capacity: usize,
}

/// Slot arena of scene elements inside the detection area
pub struct InstanceTracker {
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_component: HashMap<u64, InstanceId>,
    listener: InstanceListener,
    events: Vec<InstanceEvent>,
    pending_changes: Vec<RegionChange>,
    capacity: usize,
    bvh_max_depth: u32,
    static_dirty: bool,
}

impl InstanceTracker {
    pub fn new(capacity: usize, bvh_max_depth: u32) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            by_component: HashMap::new(),
            listener: InstanceListener::default(),
            events: Vec::new(),
            pending_changes: Vec::new(),
            capacity,
            bvh_max_depth,
            static_dirty: false,
        }
    }

    /// Sink to hand to renderer-side component hooks
    pub fn listener(&self) -> InstanceListener {
        self.listener.clone()
    }

    pub fn len(&self) -> usize {
        self.by_component.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_component.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn id_for_component(&self, component: u64) -> Option<InstanceId> {
        self.by_component.get(&component).copied()
    }

    pub fn get(&self, id: InstanceId) -> Option<&TrackedInstance> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    pub fn get_mut(&mut self, id: InstanceId) -> Option<&mut TrackedInstance> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = (InstanceId, &TrackedInstance)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.entry.as_ref().map(|entry| {
                (
                    InstanceId { index: index as u32, generation: slot.generation },
                    entry,
                )
            })
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (InstanceId, &mut TrackedInstance)> {
        self.slots.iter_mut().enumerate().filter_map(|(index, slot)| {
            let generation = slot.generation;
            slot.entry.as_mut().map(move |entry| {
                (InstanceId { index: index as u32, generation }, entry)
            })
        })
    }

    /// Track a scene element. Re-adding a tracked component returns the
    /// existing handle. `invalidate` queues the region change new content
    /// normally requires; pass false during bulk fills followed by a full
    /// invalidate.
    pub fn add(
        &mut self,
        component: Arc<dyn GiComponent>,
        kind: TrackedKind,
        cache: &mut MeshBvhCache,
        invalidate: bool,
    ) -> GiResult<InstanceId> {
        if let Some(existing) = self.by_component.get(&component.id()) {
            return Ok(*existing);
        }
        if self.by_component.len() >= self.capacity {
            return Err(GiError::CapacityExceeded(format!(
                "instance tracker full at {} slots",
                self.capacity
            )));
        }

        let dynamic = match kind {
            TrackedKind::Component | TrackedKind::Decal => !is_component_static(&*component),
            TrackedKind::OcclusionMesh => false,
        };

        let mut mesh_bvh = None;
        let mut dynamic_bvh = None;
        let mut geometry_id = None;
        match kind {
            TrackedKind::Component => {
                if let Some(mesh) = component.mesh() {
                    if dynamic {
                        dynamic_bvh = Some(DynamicMeshBvh::new(Arc::clone(&mesh), self.bvh_max_depth));
                    } else {
                        mesh_bvh = Some(cache.retain_mesh(&mesh));
                        geometry_id = Some(mesh.id);
                    }
                }
            }
            TrackedKind::OcclusionMesh => {
                if let Some(occlusion) = component.occlusion_geometry() {
                    mesh_bvh = Some(cache.retain_occlusion(&occlusion));
                    geometry_id = Some(occlusion.id);
                }
            }
            TrackedKind::Decal => {}
        }

        let extents = component.world_extents();
        let entry = TrackedInstance {
            component: Arc::clone(&component),
            kind,
            dynamic,
            extents,
            mesh_bvh,
            dynamic_bvh,
            geometry_id,
            changed: false,
            hard_changed: false,
            marked: false,
        };

        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index as usize].entry = Some(entry);
                index
            }
            None => {
                self.slots.push(Slot { generation: 0, entry: Some(entry) });
                (self.slots.len() - 1) as u32
            }
        };
        let id = InstanceId {
            index,
            generation: self.slots[index as usize].generation,
        };
        self.by_component.insert(component.id(), id);

        if invalidate {
            if dynamic {
                self.pending_changes.push(RegionChange::Touch { bounds: extents });
            } else {
                self.pending_changes
                    .push(RegionChange::Invalidate { bounds: extents, hard: false });
                self.static_dirty = true;
            }
        } else if !dynamic {
            self.static_dirty = true;
        }
        Ok(id)
    }

    /// Stop tracking one element, queueing the vacated region
    pub fn remove(&mut self, id: InstanceId, cache: &mut MeshBvhCache) -> GiResult<()> {
        let slot = self
            .slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation && slot.entry.is_some())
            .ok_or_else(|| GiError::InvalidArgument("unknown instance".into()))?;
        let _ = slot;
        self.clear_slot(id.index as usize, cache, true);
        Ok(())
    }

    /// Mark-and-sweep against the authoritative in-range component list:
    /// everything absent from `current` stops being tracked and its region
    /// is queued for invalidation.
    pub fn remove_missing(
        &mut self,
        current: &[Arc<dyn GiComponent>],
        cache: &mut MeshBvhCache,
    ) {
        for component in current {
            if let Some(id) = self.by_component.get(&component.id()) {
                if let Some(slot) = self.slots.get_mut(id.index as usize) {
                    if let Some(entry) = slot.entry.as_mut() {
                        entry.marked = true;
                    }
                }
            }
        }
        for index in 0..self.slots.len() {
            let keep = match &mut self.slots[index].entry {
                Some(entry) => std::mem::replace(&mut entry.marked, false),
                None => continue,
            };
            if !keep {
                self.clear_slot(index, cache, true);
            }
        }
    }

    /// Drop every tracked element without queueing region changes; used when
    /// the whole field invalidates anyway
    pub fn clear(&mut self, cache: &mut MeshBvhCache) {
        for index in 0..self.slots.len() {
            if self.slots[index].entry.is_some() {
                self.clear_slot_silent(index, cache);
            }
        }
        self.by_component.clear();
        self.static_dirty = true;
    }

    fn clear_slot(&mut self, index: usize, cache: &mut MeshBvhCache, queue_change: bool) {
        let Some(entry) = self.slots[index].entry.take() else {
            return;
        };
        self.slots[index].generation = self.slots[index].generation.wrapping_add(1);
        self.free.push(index as u32);
        self.by_component.remove(&entry.component.id());
        if let Some(geometry_id) = entry.geometry_id {
            cache.release(geometry_id);
        }
        if queue_change {
            if entry.dynamic {
                self.pending_changes.push(RegionChange::Touch { bounds: entry.extents });
            } else {
                // hard: probes disabled by this geometry may revalidate now
                self.pending_changes
                    .push(RegionChange::Invalidate { bounds: entry.extents, hard: true });
                self.static_dirty = true;
            }
        } else if !entry.dynamic {
            self.static_dirty = true;
        }
    }

    fn clear_slot_silent(&mut self, index: usize, cache: &mut MeshBvhCache) {
        if let Some(entry) = self.slots[index].entry.take() {
            self.slots[index].generation = self.slots[index].generation.wrapping_add(1);
            self.free.push(index as u32);
            if let Some(geometry_id) = entry.geometry_id {
                cache.release(geometry_id);
            }
        }
    }

    /// Drain queued notifications and reclassify flagged instances. Static
    /// involvement on either side of a change invalidates the union of old
    /// and new extents; purely dynamic movement only touches it.
    pub fn apply_changes(&mut self, cache: &mut MeshBvhCache) {
        let mut events = std::mem::take(&mut self.events);
        self.listener.drain(&mut events);

        for event in events.drain(..) {
            let Some(&id) = self.by_component.get(&event.component) else {
                debug!("instance tracker: event for untracked component {}", event.component);
                continue;
            };
            match event.kind {
                InstanceEventKind::Destroyed => {
                    self.clear_slot(id.index as usize, cache, true);
                }
                InstanceEventKind::TexturesChanged => {
                    if let Some(entry) = self.get_mut(id) {
                        entry.hard_changed = true;
                        entry.changed = true;
                    }
                }
                InstanceEventKind::BoundariesChanged
                | InstanceEventKind::ParentWorldChanged
                | InstanceEventKind::LayerMaskChanged => {
                    if let Some(entry) = self.get_mut(id) {
                        entry.changed = true;
                    }
                }
            }
        }
        self.events = events;

        for index in 0..self.slots.len() {
            let Some(entry) = self.slots[index].entry.as_mut() else {
                continue;
            };
            if !entry.changed {
                continue;
            }
            entry.changed = false;
            let reclassify = std::mem::replace(&mut entry.hard_changed, false);

            let was_dynamic = entry.dynamic;
            let old_extents = entry.extents;
            let new_extents = entry.component.world_extents();
            let now_dynamic = match entry.kind {
                TrackedKind::Component | TrackedKind::Decal => {
                    !is_component_static(&*entry.component)
                }
                TrackedKind::OcclusionMesh => false,
            };
            entry.extents = new_extents;

            if (reclassify || was_dynamic != now_dynamic) && entry.kind == TrackedKind::Component {
                entry.dynamic = now_dynamic;
                let released = entry.geometry_id.take();
                entry.mesh_bvh = None;
                entry.dynamic_bvh = None;
                if let Some(mesh) = entry.component.mesh() {
                    if now_dynamic {
                        entry.dynamic_bvh =
                            Some(DynamicMeshBvh::new(Arc::clone(&mesh), self.bvh_max_depth));
                    } else {
                        entry.mesh_bvh = Some(cache.retain_mesh(&mesh));
                        entry.geometry_id = Some(mesh.id);
                    }
                }
                if let Some(geometry_id) = released {
                    cache.release(geometry_id);
                }
            }

            let bounds = old_extents.union(&new_extents);
            if was_dynamic && now_dynamic {
                self.pending_changes.push(RegionChange::Touch { bounds });
            } else {
                self.pending_changes
                    .push(RegionChange::Invalidate { bounds, hard: true });
                self.static_dirty = true;
            }
        }
    }

    /// Region changes accumulated since the last call
    pub fn take_region_changes(&mut self) -> Vec<RegionChange> {
        std::mem::take(&mut self.pending_changes)
    }

    /// True when the static scene structure must rebuild; reading resets it
    pub fn take_static_dirty(&mut self) -> bool {
        std::mem::replace(&mut self.static_dirty, false)
    }

    pub fn mark_static_dirty(&mut self) {
        self.static_dirty = true;
    }

    pub fn stats(&self) -> InstanceTrackerStats {
        let mut stats = InstanceTrackerStats {
            capacity: self.capacity,
            ..InstanceTrackerStats::default()
        };
        for (_, entry) in self.iter() {
            stats.tracked += 1;
            if entry.dynamic {
                stats.dynamic_count += 1;
            } else {
                stats.static_count += 1;
            }
        }
        if stats.tracked != self.by_component.len() {
            warn!(
                "instance tracker: slot/index mismatch ({} slots, {} indexed)",
                stats.tracked,
                self.by_component.len()
            );
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candela_math::{DMat4, Vec2, Vec3, Vec3d};
    use parking_lot::RwLock;

    use crate::geometry::{InstanceMaterial, MeshFace, MeshGeometry};

    struct TestComponentState {
        extents: DAABB,
        movement_stationary: bool,
        textures_static: bool,
    }

    struct TestComponent {
        id: u64,
        mesh: Arc<MeshGeometry>,
        state: RwLock<TestComponentState>,
    }

    impl TestComponent {
        fn new(id: u64, weight_count: usize, stationary: bool) -> Arc<Self> {
            let mesh = Arc::new(MeshGeometry {
                id: 100 + id,
                positions: vec![Vec3::ZERO, Vec3::X, Vec3::Y],
                faces: vec![MeshFace { vertices: [0, 1, 2], texture: 0 }],
                texcoords: vec![Vec2::ZERO; 3],
                weight_count,
            });
            Arc::new(Self {
                id,
                mesh,
                state: RwLock::new(TestComponentState {
                    extents: DAABB::new(Vec3d::ZERO, Vec3d::splat(1.0)),
                    movement_stationary: stationary,
                    textures_static: true,
                }),
            })
        }

        fn move_to(&self, min: Vec3d, max: Vec3d) {
            self.state.write().extents = DAABB::new(min, max);
        }

        fn set_stationary(&self, stationary: bool) {
            self.state.write().movement_stationary = stationary;
        }
    }

    impl GiComponent for TestComponent {
        fn id(&self) -> u64 {
            self.id
        }
        fn world_matrix(&self) -> DMat4 {
            DMat4::from_translation(self.state.read().extents.min)
        }
        fn world_extents(&self) -> DAABB {
            self.state.read().extents
        }
        fn layer_mask(&self) -> u64 {
            1
        }
        fn importance(&self) -> f32 {
            1.0
        }
        fn render_static(&self) -> bool {
            true
        }
        fn textures_static(&self) -> bool {
            self.state.read().textures_static
        }
        fn movement_stationary(&self) -> bool {
            self.state.read().movement_stationary
        }
        fn mesh(&self) -> Option<Arc<MeshGeometry>> {
            Some(Arc::clone(&self.mesh))
        }
        fn materials(&self) -> Vec<InstanceMaterial> {
            vec![InstanceMaterial::default()]
        }
    }

    fn tracker() -> (InstanceTracker, MeshBvhCache) {
        (InstanceTracker::new(8, 12), MeshBvhCache::new(12))
    }

    #[test]
    fn test_classification() {
        let rigid = TestComponent::new(1, 0, true);
        let skinned = TestComponent::new(2, 4, true);
        let moving = TestComponent::new(3, 0, false);
        assert!(is_component_static(&*rigid));
        assert!(!is_component_static(&*skinned));
        assert!(!is_component_static(&*moving));
    }

    #[test]
    fn test_add_static_and_dynamic() {
        let (mut tracker, mut cache) = tracker();
        let rigid = TestComponent::new(1, 0, true);
        let skinned = TestComponent::new(2, 4, true);

        let a = tracker
            .add(rigid, TrackedKind::Component, &mut cache, true)
            .unwrap();
        let b = tracker
            .add(skinned, TrackedKind::Component, &mut cache, true)
            .unwrap();

        assert!(!tracker.get(a).unwrap().dynamic);
        assert!(tracker.get(a).unwrap().mesh_bvh.is_some());
        assert!(tracker.get(b).unwrap().dynamic);
        assert!(tracker.get(b).unwrap().dynamic_bvh.is_some());
        assert_eq!(cache.len(), 1);

        let changes = tracker.take_region_changes();
        assert_eq!(changes.len(), 2);
        assert!(matches!(changes[0], RegionChange::Invalidate { hard: false, .. }));
        assert!(matches!(changes[1], RegionChange::Touch { .. }));
        assert!(tracker.take_static_dirty());
    }

    #[test]
    fn test_add_twice_returns_same_id() {
        let (mut tracker, mut cache) = tracker();
        let component = TestComponent::new(1, 0, true);
        let a = tracker
            .add(Arc::clone(&component) as Arc<dyn GiComponent>, TrackedKind::Component, &mut cache, false)
            .unwrap();
        let b = tracker
            .add(component, TrackedKind::Component, &mut cache, false)
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(tracker.len(), 1);
        assert_eq!(cache.usage(101), 1);
    }

    #[test]
    fn test_capacity_exceeded() {
        let mut tracker = InstanceTracker::new(1, 12);
        let mut cache = MeshBvhCache::new(12);
        tracker
            .add(TestComponent::new(1, 0, true), TrackedKind::Component, &mut cache, false)
            .unwrap();
        let result = tracker.add(
            TestComponent::new(2, 0, true),
            TrackedKind::Component,
            &mut cache,
            false,
        );
        assert!(matches!(result, Err(GiError::CapacityExceeded(_))));
    }

    #[test]
    fn test_remove_invalidates_vacated_region() {
        let (mut tracker, mut cache) = tracker();
        let component = TestComponent::new(1, 0, true);
        let id = tracker
            .add(component, TrackedKind::Component, &mut cache, false)
            .unwrap();
        tracker.take_region_changes();

        tracker.remove(id, &mut cache).unwrap();
        assert!(tracker.get(id).is_none());
        assert!(cache.is_empty());
        let changes = tracker.take_region_changes();
        assert_eq!(changes.len(), 1);
        assert!(matches!(changes[0], RegionChange::Invalidate { hard: true, .. }));

        // stale handle stays dead after slot reuse
        let other = tracker
            .add(TestComponent::new(2, 0, true), TrackedKind::Component, &mut cache, false)
            .unwrap();
        assert_eq!(other.index(), id.index());
        assert!(tracker.get(id).is_none());
        assert!(tracker.get(other).is_some());
    }

    #[test]
    fn test_remove_missing_sweeps() {
        let (mut tracker, mut cache) = tracker();
        let keep = TestComponent::new(1, 0, true);
        let drop_ = TestComponent::new(2, 0, true);
        tracker
            .add(Arc::clone(&keep) as Arc<dyn GiComponent>, TrackedKind::Component, &mut cache, false)
            .unwrap();
        let dropped = tracker
            .add(drop_, TrackedKind::Component, &mut cache, false)
            .unwrap();
        tracker.take_region_changes();

        let current: Vec<Arc<dyn GiComponent>> = vec![keep];
        tracker.remove_missing(&current, &mut cache);

        assert_eq!(tracker.len(), 1);
        assert!(tracker.get(dropped).is_none());
        let changes = tracker.take_region_changes();
        assert_eq!(changes.len(), 1);
    }

    #[test]
    fn test_destroyed_event_clears_slot() {
        let (mut tracker, mut cache) = tracker();
        let component = TestComponent::new(1, 0, true);
        let id = tracker
            .add(Arc::clone(&component) as Arc<dyn GiComponent>, TrackedKind::Component, &mut cache, false)
            .unwrap();
        tracker.take_region_changes();

        let listener = tracker.listener();
        listener.notify(InstanceEvent {
            component: component.id(),
            kind: InstanceEventKind::Destroyed,
        });
        tracker.apply_changes(&mut cache);
        assert!(tracker.get(id).is_none());
        assert_eq!(tracker.take_region_changes().len(), 1);
    }

    #[test]
    fn test_static_move_invalidates_union() {
        let (mut tracker, mut cache) = tracker();
        let component = TestComponent::new(1, 0, true);
        tracker
            .add(Arc::clone(&component) as Arc<dyn GiComponent>, TrackedKind::Component, &mut cache, false)
            .unwrap();
        tracker.take_region_changes();
        tracker.take_static_dirty();

        component.move_to(Vec3d::new(10.0, 0.0, 0.0), Vec3d::new(11.0, 1.0, 1.0));
        tracker.listener().notify(InstanceEvent {
            component: component.id(),
            kind: InstanceEventKind::BoundariesChanged,
        });
        tracker.apply_changes(&mut cache);

        let changes = tracker.take_region_changes();
        assert_eq!(changes.len(), 1);
        match changes[0] {
            RegionChange::Invalidate { bounds, hard } => {
                assert!(hard);
                // union of old and new extents
                assert_eq!(bounds.min, Vec3d::ZERO);
                assert_eq!(bounds.max, Vec3d::new(11.0, 1.0, 1.0));
            }
            _ => panic!("expected invalidate"),
        }
        assert!(tracker.take_static_dirty());
    }

    #[test]
    fn test_dynamic_move_touches() {
        let (mut tracker, mut cache) = tracker();
        let component = TestComponent::new(1, 4, true);
        tracker
            .add(Arc::clone(&component) as Arc<dyn GiComponent>, TrackedKind::Component, &mut cache, false)
            .unwrap();
        tracker.take_region_changes();

        component.move_to(Vec3d::new(2.0, 0.0, 0.0), Vec3d::new(3.0, 1.0, 1.0));
        tracker.listener().notify(InstanceEvent {
            component: component.id(),
            kind: InstanceEventKind::BoundariesChanged,
        });
        tracker.apply_changes(&mut cache);

        let changes = tracker.take_region_changes();
        assert_eq!(changes.len(), 1);
        assert!(matches!(changes[0], RegionChange::Touch { .. }));
        assert!(!tracker.take_static_dirty());
    }

    #[test]
    fn test_reclassification_swaps_structures() {
        let (mut tracker, mut cache) = tracker();
        let component = TestComponent::new(1, 0, true);
        let id = tracker
            .add(Arc::clone(&component) as Arc<dyn GiComponent>, TrackedKind::Component, &mut cache, false)
            .unwrap();
        assert!(!tracker.get(id).unwrap().dynamic);
        assert_eq!(cache.usage(101), 1);

        component.set_stationary(false);
        tracker.listener().notify(InstanceEvent {
            component: component.id(),
            kind: InstanceEventKind::BoundariesChanged,
        });
        tracker.apply_changes(&mut cache);

        let entry = tracker.get(id).unwrap();
        assert!(entry.dynamic);
        assert!(entry.mesh_bvh.is_none());
        assert!(entry.dynamic_bvh.is_some());
        assert_eq!(cache.usage(101), 0);
    }

    #[test]
    fn test_event_for_untracked_component_ignored() {
        let (mut tracker, mut cache) = tracker();
        tracker.listener().notify(InstanceEvent {
            component: 999,
            kind: InstanceEventKind::BoundariesChanged,
        });
        tracker.apply_changes(&mut cache);
        assert!(tracker.take_region_changes().is_empty());
    }
}
