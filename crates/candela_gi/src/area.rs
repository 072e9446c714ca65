//! Detection area content tracking
//!
//! The probe field cares about content inside a camera-centered box. The
//! tracker re-queries the world only after the camera travels far enough,
//! then diffs the result against the previous content to produce entering
//! and leaving lists.

use std::collections::HashSet;
use std::sync::Arc;

use candela_math::{DAABB, Vec3d};
use log::debug;

use crate::geometry::{GiComponent, GiWorld};

/// Tracks which components currently touch the detection box
pub struct AreaTracker {
    half_extents: Vec3d,
    update_threshold: f64,
    min_importance: f32,
    position: Vec3d,
    last_update_position: Option<Vec3d>,
    inside: Vec<Arc<dyn GiComponent>>,
    inside_ids: HashSet<u64>,
    entering: Vec<Arc<dyn GiComponent>>,
    leaving: Vec<Arc<dyn GiComponent>>,
    all_leaving: bool,
    changed: bool,
    scratch: Vec<Arc<dyn GiComponent>>,
}

impl AreaTracker {
    pub fn new(half_extents: Vec3d, update_threshold: f64, min_importance: f32) -> Self {
        Self {
            half_extents,
            update_threshold,
            min_importance,
            position: Vec3d::ZERO,
            last_update_position: None,
            inside: Vec::new(),
            inside_ids: HashSet::new(),
            entering: Vec::new(),
            leaving: Vec::new(),
            all_leaving: false,
            changed: false,
            scratch: Vec::new(),
        }
    }

    pub fn set_position(&mut self, position: Vec3d) {
        self.position = position;
    }

    pub fn position(&self) -> Vec3d {
        self.position
    }

    pub fn detection_box(&self) -> DAABB {
        DAABB::from_center_half_extents(self.position, self.half_extents)
    }

    /// Force a full re-query on the next update
    pub fn invalidate(&mut self) {
        self.last_update_position = None;
    }

    /// Re-query the world if the camera moved past the update threshold and
    /// diff the content. Components outside `layer_mask` (when non-zero) or
    /// below the importance floor never enter the area.
    pub fn update(&mut self, world: &dyn GiWorld, layer_mask: u64) {
        if let Some(last) = self.last_update_position {
            if self.position.distance(last) < self.update_threshold {
                self.entering.clear();
                self.leaving.clear();
                self.all_leaving = false;
                self.changed = false;
                return;
            }
        }

        let bounds = self.detection_box();
        self.scratch.clear();
        world.components_in(&bounds, &mut self.scratch);

        let mut current: Vec<Arc<dyn GiComponent>> = Vec::with_capacity(self.scratch.len());
        let mut current_ids = HashSet::with_capacity(self.scratch.len());
        for component in self.scratch.drain(..) {
            if layer_mask != 0 && component.layer_mask() & layer_mask == 0 {
                continue;
            }
            if component.importance() < self.min_importance {
                continue;
            }
            current_ids.insert(component.id());
            current.push(component);
        }

        self.entering.clear();
        for component in &current {
            if !self.inside_ids.contains(&component.id()) {
                self.entering.push(Arc::clone(component));
            }
        }
        self.leaving.clear();
        for component in &self.inside {
            if !current_ids.contains(&component.id()) {
                self.leaving.push(Arc::clone(component));
            }
        }

        // a jump past the whole box leaves no overlap with the old content
        self.all_leaving = match self.last_update_position {
            Some(last) => {
                let old = DAABB::from_center_half_extents(last, self.half_extents);
                !old.intersects(&bounds)
            }
            None => false,
        };

        self.changed = !self.entering.is_empty() || !self.leaving.is_empty();
        if self.changed {
            debug!(
                "area tracker: {} entering, {} leaving, {} inside",
                self.entering.len(),
                self.leaving.len(),
                current.len()
            );
        }
        self.inside = current;
        self.inside_ids = current_ids;
        self.last_update_position = Some(self.position);
    }

    pub fn inside(&self) -> &[Arc<dyn GiComponent>] {
        &self.inside
    }

    pub fn entering(&self) -> &[Arc<dyn GiComponent>] {
        &self.entering
    }

    pub fn leaving(&self) -> &[Arc<dyn GiComponent>] {
        &self.leaving
    }

    /// True when the area teleported so far that no previous content remains
    pub fn all_leaving(&self) -> bool {
        self.all_leaving
    }

    pub fn has_changed(&self) -> bool {
        self.changed
    }

    pub fn clear_changes(&mut self) {
        self.entering.clear();
        self.leaving.clear();
        self.all_leaving = false;
        self.changed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candela_math::{DMat4, Vec2, Vec3};

    use crate::geometry::{InstanceMaterial, MeshFace, MeshGeometry};

    struct FixedComponent {
        id: u64,
        extents: DAABB,
        layer_mask: u64,
        importance: f32,
    }

    impl GiComponent for FixedComponent {
        fn id(&self) -> u64 {
            self.id
        }
        fn world_matrix(&self) -> DMat4 {
            DMat4::from_translation(self.extents.center())
        }
        fn world_extents(&self) -> DAABB {
            self.extents
        }
        fn layer_mask(&self) -> u64 {
            self.layer_mask
        }
        fn importance(&self) -> f32 {
            self.importance
        }
        fn render_static(&self) -> bool {
            true
        }
        fn textures_static(&self) -> bool {
            true
        }
        fn movement_stationary(&self) -> bool {
            true
        }
        fn mesh(&self) -> Option<Arc<MeshGeometry>> {
            Some(Arc::new(MeshGeometry {
                id: self.id + 1000,
                positions: vec![Vec3::ZERO, Vec3::X, Vec3::Y],
                faces: vec![MeshFace { vertices: [0, 1, 2], texture: 0 }],
                texcoords: vec![Vec2::ZERO; 3],
                weight_count: 0,
            }))
        }
        fn materials(&self) -> Vec<InstanceMaterial> {
            Vec::new()
        }
    }

    struct BoxWorld {
        components: Vec<Arc<FixedComponent>>,
    }

    impl GiWorld for BoxWorld {
        fn components_in(&self, bounds: &DAABB, out: &mut Vec<Arc<dyn GiComponent>>) {
            for component in &self.components {
                if bounds.intersects(&component.extents) {
                    out.push(Arc::clone(component) as Arc<dyn GiComponent>);
                }
            }
        }
    }

    fn component_at(id: u64, x: f64) -> Arc<FixedComponent> {
        Arc::new(FixedComponent {
            id,
            extents: DAABB::new(
                Vec3d::new(x, 0.0, 0.0),
                Vec3d::new(x + 1.0, 1.0, 1.0),
            ),
            layer_mask: 1,
            importance: 1.0,
        })
    }

    #[test]
    fn test_entering_and_leaving() {
        let world = BoxWorld {
            components: vec![component_at(1, 0.0), component_at(2, 100.0)],
        };
        let mut tracker = AreaTracker::new(Vec3d::splat(20.0), 8.0, 0.0);

        tracker.set_position(Vec3d::ZERO);
        tracker.update(&world, 1);
        assert_eq!(tracker.inside().len(), 1);
        assert_eq!(tracker.entering().len(), 1);
        assert!(tracker.leaving().is_empty());
        assert!(tracker.has_changed());
        tracker.clear_changes();

        // move within the threshold: nothing recomputes
        tracker.set_position(Vec3d::new(4.0, 0.0, 0.0));
        tracker.update(&world, 1);
        assert!(!tracker.has_changed());
        assert_eq!(tracker.inside().len(), 1);

        // move to the far component
        tracker.set_position(Vec3d::new(100.0, 0.0, 0.0));
        tracker.update(&world, 1);
        assert_eq!(tracker.entering().len(), 1);
        assert_eq!(tracker.leaving().len(), 1);
        assert_eq!(tracker.entering()[0].id(), 2);
        assert_eq!(tracker.leaving()[0].id(), 1);
        // jumped past the whole box
        assert!(tracker.all_leaving());
    }

    #[test]
    fn test_layer_mask_filter() {
        let masked = Arc::new(FixedComponent {
            id: 3,
            extents: DAABB::new(Vec3d::ZERO, Vec3d::splat(1.0)),
            layer_mask: 2,
            importance: 1.0,
        });
        let world = BoxWorld { components: vec![masked] };
        let mut tracker = AreaTracker::new(Vec3d::splat(10.0), 8.0, 0.0);
        tracker.update(&world, 1);
        assert!(tracker.inside().is_empty());

        tracker.invalidate();
        tracker.update(&world, 2);
        assert_eq!(tracker.inside().len(), 1);
    }

    #[test]
    fn test_importance_floor() {
        let faint = Arc::new(FixedComponent {
            id: 4,
            extents: DAABB::new(Vec3d::ZERO, Vec3d::splat(1.0)),
            layer_mask: 1,
            importance: 0.1,
        });
        let world = BoxWorld { components: vec![faint] };
        let mut tracker = AreaTracker::new(Vec3d::splat(10.0), 8.0, 0.5);
        tracker.update(&world, 1);
        assert!(tracker.inside().is_empty());
    }

    #[test]
    fn test_invalidate_forces_requery() {
        let world = BoxWorld { components: vec![component_at(1, 0.0)] };
        let mut tracker = AreaTracker::new(Vec3d::splat(10.0), 8.0, 0.0);
        tracker.update(&world, 1);
        tracker.clear_changes();

        // below threshold, but a forced invalidate requeries anyway
        tracker.set_position(Vec3d::new(1.0, 0.0, 0.0));
        tracker.invalidate();
        tracker.update(&world, 1);
        assert!(!tracker.has_changed());
        assert_eq!(tracker.inside().len(), 1);
    }
}
