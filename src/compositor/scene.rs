//! The scene graph: z-ordered mapped surfaces per output
//!
//! The scene only ever holds surfaces whose commits have been validated and
//! applied; hit testing and compositing read current state exclusively, so
//! neither can observe half-updated geometry.

use crate::compositor::geometry::Rect;
use crate::compositor::output::OutputId;
use crate::compositor::surface::{SurfaceId, SurfaceManager};

/// One entry in the scene stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SceneElement {
    pub surface: SurfaceId,
    /// Output this element is shown on
    pub output: OutputId,
    /// Top-left corner in global coordinates
    pub position: (i32, i32),
}

/// What the render backend receives for one surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompositeElement {
    pub surface: SurfaceId,
    pub position: (i32, i32),
    pub size: (u32, u32),
    pub transform: i32,
    pub scale: i32,
    /// Stacking depth, 0 = bottom
    pub z: u32,
}

/// Z-ordered stack of visible surfaces
///
/// Stored bottom-to-top; hit testing walks it top-to-bottom.
#[derive(Debug, Default)]
pub struct Scene {
    stack: Vec<SceneElement>,
}

impl Scene {
    pub fn new() -> Self {
        Self { stack: Vec::new() }
    }

    /// Insert a surface at the top of the stack
    ///
    /// Re-inserting an existing surface updates its output/position and
    /// raises it.
    pub fn insert(&mut self, surface: SurfaceId, output: OutputId, position: (i32, i32)) {
        self.stack.retain(|e| e.surface != surface);
        self.stack.push(SceneElement {
            surface,
            output,
            position,
        });
    }

    /// Remove a surface from the stack; idempotent
    pub fn remove(&mut self, surface: SurfaceId) -> Option<SceneElement> {
        let pos = self.stack.iter().position(|e| e.surface == surface)?;
        Some(self.stack.remove(pos))
    }

    /// Raise a surface to the top of its stack
    pub fn raise(&mut self, surface: SurfaceId) {
        if let Some(pos) = self.stack.iter().position(|e| e.surface == surface) {
            let element = self.stack.remove(pos);
            self.stack.push(element);
        }
    }

    pub fn set_position(&mut self, surface: SurfaceId, position: (i32, i32)) {
        if let Some(element) = self.stack.iter_mut().find(|e| e.surface == surface) {
            element.position = position;
        }
    }

    pub fn contains(&self, surface: SurfaceId) -> bool {
        self.stack.iter().any(|e| e.surface == surface)
    }

    pub fn element(&self, surface: SurfaceId) -> Option<&SceneElement> {
        self.stack.iter().find(|e| e.surface == surface)
    }

    /// Build the ordered composite list for one output
    ///
    /// Sizes come from each surface's current (validated) state.
    pub fn composite_list(
        &self,
        output: OutputId,
        surfaces: &SurfaceManager,
    ) -> Vec<CompositeElement> {
        self.stack
            .iter()
            .filter(|e| e.output == output)
            .enumerate()
            .filter_map(|(z, e)| {
                let surface = surfaces.get(e.surface)?;
                Some(CompositeElement {
                    surface: e.surface,
                    position: e.position,
                    size: surface.current.size,
                    transform: surface.current.transform,
                    scale: surface.current.scale.max(1),
                    z: z as u32,
                })
            })
            .collect()
    }

    /// Top-to-bottom hit test over current surface state
    ///
    /// Returns the hit surface and surface-local coordinates. A surface with
    /// an input region only accepts input inside it.
    pub fn hit_test(
        &self,
        x: f64,
        y: f64,
        surfaces: &SurfaceManager,
    ) -> Option<(SurfaceId, f64, f64)> {
        for element in self.stack.iter().rev() {
            let Some(surface) = surfaces.get(element.surface) else {
                continue;
            };
            let (w, h) = surface.current.size;
            let bounds = Rect::new(element.position.0, element.position.1, w, h);
            if !bounds.contains(x, y) {
                continue;
            }
            let local_x = x - element.position.0 as f64;
            let local_y = y - element.position.1 as f64;
            if let Some(region) = &surface.current.input_region {
                if !region.contains(local_x, local_y) {
                    continue;
                }
            }
            return Some((element.surface, local_x, local_y));
        }
        None
    }

    /// Move every element off a dying output
    ///
    /// With a replacement output the elements are reassigned in place; with
    /// none they are removed and returned so the caller can unmap them.
    pub fn rehome(&mut self, from: OutputId, to: Option<OutputId>) -> Vec<SurfaceId> {
        match to {
            Some(target) => {
                for element in self.stack.iter_mut().filter(|e| e.output == from) {
                    element.output = target;
                }
                Vec::new()
            }
            None => {
                let evicted: Vec<SurfaceId> = self
                    .stack
                    .iter()
                    .filter(|e| e.output == from)
                    .map(|e| e.surface)
                    .collect();
                self.stack.retain(|e| e.output != from);
                evicted
            }
        }
    }

    /// Surfaces in stacking order, bottom first
    pub fn surfaces(&self) -> impl Iterator<Item = SurfaceId> + '_ {
        self.stack.iter().map(|e| e.surface)
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapped_surface(surfaces: &mut SurfaceManager, size: (u32, u32)) -> SurfaceId {
        let id = surfaces.create(None);
        let surface = surfaces.get_mut(id).unwrap();
        surface.attach(Some(crate::compositor::buffer::BufferId(id.0)), 0, 0);
        surface.apply_pending(Some(size));
        id
    }

    #[test]
    fn test_insert_and_raise() {
        let mut scene = Scene::new();
        let output = OutputId(1);
        let a = SurfaceId(1);
        let b = SurfaceId(2);

        scene.insert(a, output, (0, 0));
        scene.insert(b, output, (10, 10));
        assert_eq!(scene.surfaces().collect::<Vec<_>>(), vec![a, b]);

        scene.raise(a);
        assert_eq!(scene.surfaces().collect::<Vec<_>>(), vec![b, a]);
    }

    #[test]
    fn test_remove_idempotent() {
        let mut scene = Scene::new();
        let a = SurfaceId(1);
        scene.insert(a, OutputId(1), (0, 0));
        assert!(scene.remove(a).is_some());
        assert!(scene.remove(a).is_none());
    }

    #[test]
    fn test_hit_test_topmost_wins() {
        let mut surfaces = SurfaceManager::new();
        let mut scene = Scene::new();
        let output = OutputId(1);

        let below = mapped_surface(&mut surfaces, (200, 200));
        let above = mapped_surface(&mut surfaces, (100, 100));
        scene.insert(below, output, (0, 0));
        scene.insert(above, output, (50, 50));

        // Inside both: the top surface wins
        let (hit, lx, ly) = scene.hit_test(60.0, 60.0, &surfaces).unwrap();
        assert_eq!(hit, above);
        assert_eq!((lx, ly), (10.0, 10.0));

        // Only inside the lower one
        let (hit, _, _) = scene.hit_test(10.0, 10.0, &surfaces).unwrap();
        assert_eq!(hit, below);

        // Outside everything
        assert!(scene.hit_test(500.0, 500.0, &surfaces).is_none());
    }

    #[test]
    fn test_hit_test_respects_input_region() {
        let mut surfaces = SurfaceManager::new();
        let mut scene = Scene::new();

        let id = mapped_surface(&mut surfaces, (100, 100));
        let mut region = crate::compositor::geometry::Region::new();
        region.add(0, 0, 50, 50);
        surfaces.get_mut(id).unwrap().current.input_region = Some(region);
        scene.insert(id, OutputId(1), (0, 0));

        assert!(scene.hit_test(25.0, 25.0, &surfaces).is_some());
        // Inside the surface bounds but outside its input region
        assert!(scene.hit_test(75.0, 75.0, &surfaces).is_none());
    }

    #[test]
    fn test_composite_list_orders_by_z() {
        let mut surfaces = SurfaceManager::new();
        let mut scene = Scene::new();
        let output = OutputId(1);

        let a = mapped_surface(&mut surfaces, (10, 10));
        let b = mapped_surface(&mut surfaces, (20, 20));
        scene.insert(a, output, (0, 0));
        scene.insert(b, output, (5, 5));

        let list = scene.composite_list(output, &surfaces);
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].surface, a);
        assert_eq!(list[0].z, 0);
        assert_eq!(list[1].surface, b);
        assert_eq!(list[1].z, 1);
        assert_eq!(list[1].size, (20, 20));
    }

    #[test]
    fn test_rehome_to_replacement() {
        let mut scene = Scene::new();
        let a = SurfaceId(1);
        scene.insert(a, OutputId(1), (0, 0));

        let evicted = scene.rehome(OutputId(1), Some(OutputId(2)));
        assert!(evicted.is_empty());
        assert_eq!(scene.element(a).unwrap().output, OutputId(2));
    }

    #[test]
    fn test_rehome_without_replacement_evicts() {
        let mut scene = Scene::new();
        let a = SurfaceId(1);
        let b = SurfaceId(2);
        scene.insert(a, OutputId(1), (0, 0));
        scene.insert(b, OutputId(2), (0, 0));

        let evicted = scene.rehome(OutputId(1), None);
        assert_eq!(evicted, vec![a]);
        assert!(!scene.contains(a));
        assert!(scene.contains(b));
    }
}
