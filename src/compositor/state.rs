//! Global compositor state and the event-driven pipeline
//!
//! One [`CompositorState`] is constructed at startup and passed down to
//! everything that needs it; there are no global singletons. All mutation
//! happens on the event-loop thread, so none of this is locked.
//!
//! The pipeline: a client request mutates a surface's pending state; on
//! commit the pending state is validated against role rules and atomically
//! swapped into current; the owning output is damaged; on the next frame
//! tick the scene's current state is handed to the render backend, with at
//! most one frame in flight per output.
//!
//! Server-to-client traffic (configures, buffer releases, frame callbacks)
//! is queued as [`ServerEvent`]s and drained by the connection layer after
//! each dispatch round.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, info, warn};

use crate::compositor::app::{AppId, AppRegistry, ConnectionId};
use crate::compositor::buffer::{BufferId, BufferManager};
use crate::compositor::geometry::Rect;
use crate::compositor::output::{Output, OutputId, OutputManager};
use crate::compositor::scene::Scene;
use crate::compositor::surface::{
    CommitError, MapState, SentConfigure, SurfaceId, SurfaceManager, SurfaceRole,
};
use crate::compositor::window::{WindowId, WindowRecord, WindowStateFlags};
use crate::input::seat::{KeyboardEvent, PointerEvent, Seat};
use crate::input::DeviceId;
use crate::renderer::{RenderBackend, RenderError};

/// Shell bookkeeping for a popup surface
#[derive(Debug, Clone, Copy)]
pub struct PopupRecord {
    pub parent: SurfaceId,
    /// Geometry relative to the parent surface
    pub geometry: Rect,
}

/// Server-to-client messages queued by the pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Toplevel configure: size/state proposal plus the serial to ack
    Configure {
        surface: SurfaceId,
        window: WindowId,
        serial: u32,
        size: (u32, u32),
        states: Vec<u8>,
    },
    /// Popup configure: placement relative to the parent plus the serial
    PopupConfigure {
        surface: SurfaceId,
        serial: u32,
        geometry: Rect,
    },
    /// The producer may reuse this buffer
    BufferRelease { buffer: BufferId },
    /// A frame containing the surface was presented
    FrameDone {
        surface: SurfaceId,
        callback: u32,
        time_ms: u32,
    },
}

/// The global compositor state
pub struct CompositorState {
    /// All live surfaces
    pub surfaces: SurfaceManager,
    /// Buffer table and release bookkeeping
    pub buffers: BufferManager,
    /// Application records and the window registry
    pub apps: AppRegistry,
    /// Connected outputs
    pub outputs: OutputManager,
    /// Z-ordered mapped surfaces
    pub scene: Scene,
    /// Input devices and focus
    pub seat: Seat,
    /// Popup role bookkeeping
    popups: HashMap<SurfaceId, PopupRecord>,
    /// Buffers held by an in-flight frame, per output
    in_flight: HashMap<OutputId, Vec<BufferId>>,
    /// Queued server-to-client events
    events: Vec<ServerEvent>,
    /// Serial counter for input events
    serial: AtomicU64,
}

impl CompositorState {
    pub fn new() -> Self {
        Self {
            surfaces: SurfaceManager::new(),
            buffers: BufferManager::new(),
            apps: AppRegistry::new(),
            outputs: OutputManager::new(),
            scene: Scene::new(),
            seat: Seat::new(),
            popups: HashMap::new(),
            in_flight: HashMap::new(),
            events: Vec::new(),
            serial: AtomicU64::new(1),
        }
    }

    /// Next global input-event serial
    pub fn next_serial(&self) -> u32 {
        self.serial.fetch_add(1, Ordering::Relaxed) as u32
    }

    /// Drain queued server-to-client events
    pub fn take_events(&mut self) -> Vec<ServerEvent> {
        std::mem::take(&mut self.events)
    }

    // ------------------------------------------------------------------
    // Application lifecycle
    // ------------------------------------------------------------------

    /// A client connection completed its handshake
    pub fn app_connected(&mut self, connection: ConnectionId) -> AppId {
        let app = self.apps.connect(connection);
        info!("App {:?} connected", app);
        app
    }

    /// A client connection was lost; tear down everything it owned
    ///
    /// Every window is force-unmapped (scene and outputs notified) before
    /// the record is dropped, so no surface reference survives the app.
    pub fn app_disconnected(&mut self, app: AppId) {
        let windows = self.apps.remove_app(app);
        info!("App {:?} disconnected, {} window(s)", app, windows.len());
        for window in &windows {
            self.force_unmap(window.surface);
        }
        for surface in self.surfaces.owned_by(app) {
            self.destroy_surface(surface);
        }
    }

    // ------------------------------------------------------------------
    // Surface lifecycle
    // ------------------------------------------------------------------

    pub fn create_surface(&mut self, owner: Option<AppId>) -> SurfaceId {
        let id = self.surfaces.create(owner);
        debug!("Created surface {:?}", id);
        id
    }

    /// Remove a surface from the scene without destroying it
    fn force_unmap(&mut self, surface: SurfaceId) {
        if let Some(element) = self.scene.remove(surface) {
            self.damage_output(element.output);
        }
        if let Some(s) = self.surfaces.get_mut(surface) {
            if s.map_state == MapState::Mapped {
                s.map_state = MapState::Unmapped;
            }
        }
        self.clear_focus(surface);
        self.unmap_popups_of(surface);
    }

    /// Unmap every mapped popup whose parent just left the scene
    fn unmap_popups_of(&mut self, parent: SurfaceId) {
        let children: Vec<SurfaceId> = self
            .popups
            .iter()
            .filter(|(_, p)| p.parent == parent)
            .map(|(s, _)| *s)
            .collect();
        for child in children {
            if self.scene.contains(child) {
                self.force_unmap(child);
            }
        }
    }

    fn clear_focus(&mut self, surface: SurfaceId) {
        if self.seat.keyboard_focus() == Some(surface) {
            // The surface is going away; there is nobody to deliver the
            // leave to, so the events are dropped.
            let _ = self.seat.set_keyboard_focus(None);
        }
        if self.seat.pointer_focus() == Some(surface) {
            self.seat.pointer_mut().set_focus(None, 0.0, 0.0);
            self.seat.pointer_mut().end_grab();
        }
        if self.seat.pointer().cursor() == Some(surface) {
            self.seat.pointer_mut().set_cursor(None, 0, 0);
        }
    }

    /// Destroy a surface; terminal, the id is never reused
    pub fn destroy_surface(&mut self, surface: SurfaceId) {
        self.force_unmap(surface);
        if let Some((_, window)) = self.apps.window_for_surface(surface) {
            self.apps.remove_window(window);
        }
        self.popups.remove(&surface);
        if let Some(mut s) = self.surfaces.remove(surface) {
            s.map_state = MapState::Destroyed;
            if let Some(buffer) = s.current.buffer {
                self.buffers.release(buffer);
            }
            debug!("Destroyed surface {:?}", surface);
        }
        self.flush_buffer_releases();
    }

    // ------------------------------------------------------------------
    // Shell protocol: roles, configure/ack, commit
    // ------------------------------------------------------------------

    /// Assign the toplevel role and create the window record
    pub fn create_toplevel(
        &mut self,
        app: AppId,
        surface: SurfaceId,
    ) -> Result<WindowId, CommitError> {
        let s = self
            .surfaces
            .get_mut(surface)
            .ok_or(CommitError::UnknownSurface)?;
        s.set_role(SurfaceRole::Toplevel)?;

        let window = WindowRecord::new(app, surface);
        let id = window.id;
        self.apps
            .add_window(window)
            .map_err(|_| CommitError::UnknownSurface)?;
        debug!("Created toplevel {:?} for surface {:?}", id, surface);
        Ok(id)
    }

    /// Assign the popup role with a positioner-derived geometry
    pub fn create_popup(
        &mut self,
        surface: SurfaceId,
        parent: SurfaceId,
        geometry: Rect,
    ) -> Result<(), CommitError> {
        if self.surfaces.get(parent).is_none() {
            return Err(CommitError::ParentNotMapped);
        }
        let s = self
            .surfaces
            .get_mut(surface)
            .ok_or(CommitError::UnknownSurface)?;
        s.set_role(SurfaceRole::Popup { parent })?;
        self.popups.insert(surface, PopupRecord { parent, geometry });
        debug!(
            "Created popup {:?} on parent {:?} at {:?}",
            surface, parent, geometry
        );
        Ok(())
    }

    /// Client destroyed its popup role object
    pub fn dismiss_popup(&mut self, surface: SurfaceId) {
        self.popups.remove(&surface);
        self.force_unmap(surface);
    }

    /// Move a popup to a new positioner-derived geometry
    pub fn reposition_popup(&mut self, surface: SurfaceId, geometry: Rect) -> Option<u32> {
        let record = self.popups.get_mut(&surface)?;
        record.geometry = geometry;
        let parent = record.parent;
        if self.scene.contains(surface) {
            if let Some(parent_pos) = self.scene.element(parent).map(|e| e.position) {
                self.scene.set_position(
                    surface,
                    (parent_pos.0 + geometry.x, parent_pos.1 + geometry.y),
                );
            }
            if let Some(element) = self.scene.element(surface).copied() {
                self.damage_output(element.output);
            }
        }
        self.send_configure(surface, (geometry.width, geometry.height))
    }

    /// Queue a configure for a surface and record its serial
    pub fn send_configure(&mut self, surface: SurfaceId, size: (u32, u32)) -> Option<u32> {
        let s = self.surfaces.get_mut(surface)?;
        let serial = s.configure.record_sent(size);
        match s.role {
            SurfaceRole::Popup { .. } => {
                let geometry = self
                    .popups
                    .get(&surface)
                    .map(|p| p.geometry)
                    .unwrap_or_default();
                self.events.push(ServerEvent::PopupConfigure {
                    surface,
                    serial,
                    geometry,
                });
            }
            _ => {
                let (window, states) = match self.apps.window_for_surface(surface) {
                    Some((_, id)) => {
                        let w = self.apps.window(id)?;
                        (id, w.states_wire())
                    }
                    None => return None,
                };
                self.events.push(ServerEvent::Configure {
                    surface,
                    window,
                    serial,
                    size,
                    states,
                });
            }
        }
        debug!("Configure {:?} serial {} size {:?}", surface, serial, size);
        Some(serial)
    }

    /// Acknowledge a configure
    ///
    /// A serial that was never sent (or already retired) is rejected and
    /// logged; surface state is untouched and the caller escalates it as a
    /// protocol violation on the offending connection only.
    pub fn ack_configure(
        &mut self,
        surface: SurfaceId,
        serial: u32,
    ) -> Result<SentConfigure, CommitError> {
        let s = self
            .surfaces
            .get_mut(surface)
            .ok_or(CommitError::UnknownSurface)?;
        let acked = s.configure.ack(serial).inspect_err(|e| {
            warn!("Surface {:?}: rejected ack: {}", surface, e);
        })?;
        debug!("Surface {:?} acked serial {}", surface, serial);
        // An already-committed buffer plus this ack is enough to map
        self.try_map(surface);
        Ok(acked)
    }

    /// Validate and atomically apply a surface's pending state
    pub fn commit(&mut self, surface: SurfaceId) -> Result<MapState, CommitError> {
        // Validation happens before any mutation; an invalid commit is
        // rejected whole, never partially applied.
        let (role, pending_buffer, has_attach) = {
            let s = self
                .surfaces
                .get(surface)
                .ok_or(CommitError::UnknownSurface)?;
            (s.role, s.pending.buffer, s.has_pending_attach())
        };

        let buffer_size = match (has_attach, pending_buffer) {
            (true, Some(buffer)) => {
                let b = self
                    .buffers
                    .get(buffer)
                    .ok_or(CommitError::UnknownBuffer)?;
                Some((b.width, b.height))
            }
            _ => None,
        };

        if let SurfaceRole::Popup { parent } = role {
            let attaching = matches!((has_attach, pending_buffer), (true, Some(_)));
            let parent_mapped = self
                .surfaces
                .get(parent)
                .map(|p| p.is_mapped())
                .unwrap_or(false);
            if attaching && !parent_mapped {
                return Err(CommitError::ParentNotMapped);
            }
        }

        let (old_buffer, new_buffer) = {
            let s = self.surfaces.get_mut(surface).unwrap();
            let old = s.current.buffer;
            s.apply_pending(buffer_size);
            (old, s.current.buffer)
        };

        // Buffer holds follow the current state: the compositor holds
        // exactly the buffers it may still read from.
        if old_buffer != new_buffer {
            if let Some(new) = new_buffer {
                self.buffers.acquire(new)?;
            }
            if let Some(old) = old_buffer {
                self.buffers.release(old);
            }
        }

        let state = self.apply_map_transition(surface);
        self.flush_buffer_releases();
        Ok(state)
    }

    /// Advance the map lifecycle after a commit
    fn apply_map_transition(&mut self, surface: SurfaceId) -> MapState {
        let (role, map_state, has_buffer, acked) = {
            let s = self.surfaces.get(surface).expect("surface exists");
            (
                s.role,
                s.map_state,
                s.current.buffer.is_some(),
                s.configure.acked().is_some(),
            )
        };

        match role {
            SurfaceRole::None => map_state,
            SurfaceRole::Cursor => {
                // Cursors skip the configure handshake entirely
                let s = self.surfaces.get_mut(surface).unwrap();
                s.map_state = if has_buffer {
                    MapState::Mapped
                } else {
                    MapState::Unmapped
                };
                if let Some(primary) = self.outputs.primary() {
                    self.damage_output(primary);
                }
                self.surfaces.get(surface).unwrap().map_state
            }
            SurfaceRole::Toplevel | SurfaceRole::Popup { .. } => {
                match (has_buffer, acked) {
                    (true, true) => {
                        self.try_map(surface);
                        if let Some(element) = self.scene.element(surface).copied() {
                            self.damage_output(element.output);
                        }
                    }
                    (true, false) | (false, _) => {
                        if map_state == MapState::Uncommitted {
                            // First commit starts the configure cycle
                            let s = self.surfaces.get_mut(surface).unwrap();
                            s.map_state = MapState::Configuring;
                            self.send_initial_configure(surface);
                        } else if !has_buffer && map_state == MapState::Mapped {
                            // Null attach: immediate scene removal, object kept
                            self.force_unmap(surface);
                        }
                    }
                }
                self.surfaces.get(surface).unwrap().map_state
            }
        }
    }

    fn send_initial_configure(&mut self, surface: SurfaceId) {
        // Size 0x0 lets the client pick its own dimensions
        self.send_configure(surface, (0, 0));
    }

    /// Map a surface if it has both a buffer and an acked configure
    fn try_map(&mut self, surface: SurfaceId) {
        let (role, eligible) = {
            let Some(s) = self.surfaces.get(surface) else {
                return;
            };
            let eligible = matches!(
                s.map_state,
                MapState::Configuring | MapState::Unmapped | MapState::Mapped
            ) && s.current.buffer.is_some()
                && s.configure.acked().is_some();
            (s.role, eligible)
        };
        if !eligible {
            return;
        }

        let position = match role {
            SurfaceRole::Popup { parent } => {
                let Some(record) = self.popups.get(&surface) else {
                    return;
                };
                // A popup only maps while its parent is on screen
                let Some(parent_pos) = self.scene.element(parent).map(|e| e.position) else {
                    return;
                };
                (
                    parent_pos.0 + record.geometry.x,
                    parent_pos.1 + record.geometry.y,
                )
            }
            SurfaceRole::Toplevel => {
                // A toplevel without a live window record never maps
                let Some((_, window)) = self.apps.window_for_surface(surface) else {
                    return;
                };
                // Window geometry tracks the committed buffer size
                let size = self.surfaces.get(surface).unwrap().current.size;
                if let Some(w) = self.apps.window_mut(window) {
                    w.geometry.width = size.0;
                    w.geometry.height = size.1;
                }
                self.apps
                    .window(window)
                    .map(|w| (w.geometry.x, w.geometry.y))
                    .unwrap_or((0, 0))
            }
            _ => return,
        };

        let Some(output) = self.output_for_new_surface() else {
            return;
        };

        let was_mapped = self.scene.contains(surface);
        if !was_mapped {
            self.scene.insert(surface, output, position);
            let s = self.surfaces.get_mut(surface).unwrap();
            s.map_state = MapState::Mapped;
            debug!("Mapped surface {:?} at {:?}", surface, position);
        }
        self.damage_output(output);
    }

    fn output_for_new_surface(&self) -> Option<OutputId> {
        self.outputs.primary()
    }

    // ------------------------------------------------------------------
    // Window management
    // ------------------------------------------------------------------

    /// Remove a window record (client destroyed its toplevel); idempotent
    pub fn remove_window(&mut self, window: WindowId) {
        if let Some(record) = self.apps.remove_window(window) {
            self.force_unmap(record.surface);
            debug!("Removed window {:?}", window);
        }
    }

    /// Activate a window: raise, focus, and reconfigure both sides
    pub fn focus_window(&mut self, window: WindowId) -> Vec<KeyboardEvent> {
        let Some(record) = self.apps.window(window) else {
            return Vec::new();
        };
        let surface = record.surface;
        let app = record.app;
        let size = (record.geometry.width, record.geometry.height);

        // Deactivate the previously focused window
        let previous = self
            .seat
            .keyboard_focus()
            .and_then(|s| self.apps.window_for_surface(s))
            .map(|(_, w)| w)
            .filter(|w| *w != window);
        if let Some(prev) = previous {
            if let Some(w) = self.apps.window_mut(prev) {
                let surface = w.surface;
                let size = (w.geometry.width, w.geometry.height);
                if w.set_state(WindowStateFlags::ACTIVATED, false) {
                    self.send_configure(surface, size);
                }
            }
        }

        if let Some(w) = self.apps.window_mut(window) {
            if w.set_state(WindowStateFlags::ACTIVATED, true) {
                self.send_configure(surface, size);
            }
        }

        self.apps.set_focused(Some(app));
        self.scene.raise(surface);
        if let Some(element) = self.scene.element(surface).copied() {
            self.damage_output(element.output);
        }
        self.seat.set_keyboard_focus(Some(surface))
    }

    // ------------------------------------------------------------------
    // Input routing
    // ------------------------------------------------------------------

    /// Route pointer motion through scene hit testing
    pub fn pointer_motion(&mut self, time: u32, x: f64, y: f64) -> Vec<PointerEvent> {
        self.seat
            .handle_pointer_motion(time, x, y, &self.scene, &self.surfaces)
    }

    /// Route a pointer button; a press also applies click-to-focus
    pub fn pointer_button(
        &mut self,
        device: Option<DeviceId>,
        time: u32,
        button: u32,
        pressed: bool,
    ) -> (Vec<PointerEvent>, Vec<KeyboardEvent>) {
        let (events, hit) = self.seat.handle_pointer_button(device, time, button, pressed);
        let keyboard_events = match hit.and_then(|s| self.apps.window_for_surface(s)) {
            Some((_, window)) => self.focus_window(window),
            None => Vec::new(),
        };
        (events, keyboard_events)
    }

    /// A client sets (or clears) its cursor image
    pub fn set_cursor(
        &mut self,
        app: AppId,
        surface: Option<SurfaceId>,
        hotspot_x: i32,
        hotspot_y: i32,
    ) -> Result<(), CommitError> {
        if let Some(id) = surface {
            let s = self
                .surfaces
                .get_mut(id)
                .ok_or(CommitError::UnknownSurface)?;
            s.set_role(SurfaceRole::Cursor)?;
            self.apps.set_cursor_owner(Some(app));
        } else if self
            .apps
            .get(app)
            .map(|a| a.mouse_cursor_connected())
            .unwrap_or(false)
        {
            self.apps.set_cursor_owner(None);
        }
        self.seat
            .pointer_mut()
            .set_cursor(surface, hotspot_x, hotspot_y);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Output lifecycle and frame scheduling
    // ------------------------------------------------------------------

    /// Register a detected output
    pub fn add_output(&mut self, output: Output) -> OutputId {
        let id = self.outputs.add(output);
        info!("Output {:?} added", id);
        id
    }

    /// Output hot-unplug: re-home its surfaces, then drop the record
    ///
    /// Surfaces move to the remaining primary output if there is one,
    /// otherwise they are unmapped. Either way no scene reference to the
    /// dead output survives this call.
    pub fn remove_output(&mut self, id: OutputId) {
        self.release_in_flight(id);
        let Some(output) = self.outputs.remove(id) else {
            return;
        };
        info!("Output {:?} ({}) removed", id, output.name);

        let target = self.outputs.primary();
        let evicted = self.scene.rehome(id, target);
        for surface in evicted {
            if let Some(s) = self.surfaces.get_mut(surface) {
                if s.map_state == MapState::Mapped {
                    s.map_state = MapState::Unmapped;
                }
            }
            self.clear_focus(surface);
        }
        if let Some(t) = target {
            self.damage_output(t);
        }
    }

    pub fn damage_output(&mut self, id: OutputId) {
        if let Some(output) = self.outputs.get_mut(id) {
            output.mark_damaged();
        }
    }

    /// Composite one output if it is damaged and has no frame in flight
    ///
    /// Returns whether a frame was issued. The composite list is built from
    /// current (validated) state only; frame callbacks for every composited
    /// surface are queued once the frame is issued.
    pub fn render_output(
        &mut self,
        id: OutputId,
        backend: &mut dyn RenderBackend,
        now_ms: u32,
    ) -> Result<bool, RenderError> {
        let Some(output) = self.outputs.get(id) else {
            return Ok(false);
        };
        if !output.needs_frame() {
            return Ok(false);
        }

        let mut elements = self.scene.composite_list(id, &self.surfaces);

        // The cursor composites above everything, at the pointer position
        if let Some(cursor) = self.seat.pointer().cursor() {
            if let Some(s) = self.surfaces.get(cursor) {
                if s.is_mapped() {
                    let (px, py) = self.seat.pointer().position();
                    let (hx, hy) = self.seat.pointer().cursor_hotspot();
                    elements.push(crate::compositor::scene::CompositeElement {
                        surface: cursor,
                        position: (px as i32 - hx, py as i32 - hy),
                        size: s.current.size,
                        transform: s.current.transform,
                        scale: s.current.scale.max(1),
                        z: elements.len() as u32,
                    });
                }
            }
        }

        // Frame holds: the in-flight frame keeps every buffer it reads
        let mut held = Vec::new();
        for element in &elements {
            if let Some(buffer) = self.surfaces.get(element.surface).and_then(|s| s.current.buffer)
            {
                if self.buffers.acquire(buffer).is_ok() {
                    held.push(buffer);
                }
            }
        }
        self.in_flight.insert(id, held);

        let output = self.outputs.get_mut(id).unwrap();
        output.begin_frame();
        let output = self.outputs.get(id).unwrap();
        backend.composite(output, &elements)?;

        for element in &elements {
            if let Some(s) = self.surfaces.get_mut(element.surface) {
                for callback in s.take_frame_callbacks() {
                    self.events.push(ServerEvent::FrameDone {
                        surface: element.surface,
                        callback,
                        time_ms: now_ms,
                    });
                }
            }
        }
        debug!("Composited {} element(s) on {:?}", elements.len(), id);
        Ok(true)
    }

    /// The previous present on an output completed
    pub fn frame_done(&mut self, id: OutputId) {
        if let Some(output) = self.outputs.get_mut(id) {
            output.frame_done();
        }
        self.release_in_flight(id);
    }

    fn release_in_flight(&mut self, id: OutputId) {
        if let Some(held) = self.in_flight.remove(&id) {
            for buffer in held {
                self.buffers.release(buffer);
            }
            self.flush_buffer_releases();
        }
    }

    fn flush_buffer_releases(&mut self) {
        for buffer in self.buffers.take_releases() {
            self.events.push(ServerEvent::BufferRelease { buffer });
        }
    }
}

impl Default for CompositorState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compositor::buffer::{Buffer, BufferStorage, PixelFormat};
    use crate::compositor::output::OutputMode;
    use crate::renderer::HeadlessBackend;
    use crate::protocol::shm::ShmPoolId;

    fn state_with_output() -> (CompositorState, OutputId) {
        let mut state = CompositorState::new();
        let mut output = Output::new("headless-1".into(), "Nacre".into(), "Virtual".into());
        output.add_mode(OutputMode {
            width: 1920,
            height: 1080,
            refresh: 60_000,
            preferred: true,
        });
        let id = state.add_output(output);
        (state, id)
    }

    fn test_buffer(state: &mut CompositorState, width: u32, height: u32) -> BufferId {
        state.buffers.insert(Buffer::new(
            width,
            height,
            width * 4,
            PixelFormat::Argb8888,
            BufferStorage::Shm {
                pool: ShmPoolId(1),
                offset: 0,
            },
        ))
    }

    /// Walk a fresh toplevel through configure/ack/commit to Mapped
    fn map_toplevel(state: &mut CompositorState, app: AppId) -> (SurfaceId, WindowId) {
        let surface = state.create_surface(Some(app));
        let window = state.create_toplevel(app, surface).unwrap();

        // Initial commit starts the configure cycle
        assert_eq!(state.commit(surface).unwrap(), MapState::Configuring);
        let serial = last_configure_serial(state, surface);
        state.ack_configure(surface, serial).unwrap();

        let buffer = test_buffer(state, 100, 100);
        state.surfaces.get_mut(surface).unwrap().attach(Some(buffer), 0, 0);
        assert_eq!(state.commit(surface).unwrap(), MapState::Mapped);
        (surface, window)
    }

    fn last_configure_serial(state: &mut CompositorState, surface: SurfaceId) -> u32 {
        state
            .surfaces
            .get(surface)
            .unwrap()
            .configure
            .last_sent_serial()
            .expect("a configure was sent")
    }

    #[test]
    fn test_connect_map_scenario() {
        // Client connects, creates a window, commits a 100x100 buffer,
        // acks the configure, and becomes visible in the next frame.
        let (mut state, output) = state_with_output();
        let app = state.app_connected(ConnectionId::new());
        state.apps.get_mut(app).unwrap().bundle_id = Some("com.example.app".into());

        let surface = state.create_surface(Some(app));
        let window = state.create_toplevel(app, surface).unwrap();

        let buffer = test_buffer(&mut state, 100, 100);
        state.surfaces.get_mut(surface).unwrap().attach(Some(buffer), 0, 0);
        // Committing a buffer before any ack leaves the surface configuring
        assert_eq!(state.commit(surface).unwrap(), MapState::Configuring);
        assert!(!state.scene.contains(surface));

        // Server sent configure serial 1; client acks it and maps
        let serial = last_configure_serial(&mut state, surface);
        assert_eq!(serial, 1);
        state.ack_configure(surface, serial).unwrap();

        let record = state.apps.get(app).unwrap();
        assert!(record.window(window).is_some());
        assert_eq!(
            state.surfaces.get(surface).unwrap().map_state,
            MapState::Mapped
        );

        // The window appears in the next composited frame
        let mut backend = HeadlessBackend::new();
        state.damage_output(output);
        assert!(state.render_output(output, &mut backend, 16).unwrap());
        let frame = backend.last_frame().unwrap();
        assert!(frame.elements.iter().any(|e| e.surface == surface));
    }

    #[test]
    fn test_unacked_commit_stays_configuring() {
        let (mut state, _output) = state_with_output();
        let app = state.app_connected(ConnectionId::new());
        let surface = state.create_surface(Some(app));
        let _window = state.create_toplevel(app, surface).unwrap();

        let buffer = test_buffer(&mut state, 64, 64);
        state.surfaces.get_mut(surface).unwrap().attach(Some(buffer), 0, 0);
        assert_eq!(state.commit(surface).unwrap(), MapState::Configuring);

        // More commits without an ack change nothing
        state.surfaces.get_mut(surface).unwrap().damage(0, 0, 8, 8);
        assert_eq!(state.commit(surface).unwrap(), MapState::Configuring);
        assert!(!state.scene.contains(surface));
    }

    #[test]
    fn test_stale_ack_rejected_without_crash() {
        let (mut state, _output) = state_with_output();
        let app = state.app_connected(ConnectionId::new());
        let surface = state.create_surface(Some(app));
        let _window = state.create_toplevel(app, surface).unwrap();
        state.commit(surface).unwrap();

        // Send two more configures so the last sent serial is 3
        state.send_configure(surface, (200, 200));
        state.send_configure(surface, (300, 300));
        assert_eq!(last_configure_serial(&mut state, surface), 3);

        // Acking serial 5 (never sent) is rejected; state is unchanged
        let before = state.surfaces.get(surface).unwrap().map_state;
        let err = state.ack_configure(surface, 5).unwrap_err();
        assert!(matches!(err, CommitError::InvalidSerial { serial: 5, .. }));
        assert_eq!(state.surfaces.get(surface).unwrap().map_state, before);
        assert!(state
            .surfaces
            .get(surface)
            .unwrap()
            .configure
            .acked()
            .is_none());
    }

    #[test]
    fn test_unmap_remap_round_trip() {
        let (mut state, _output) = state_with_output();
        let app = state.app_connected(ConnectionId::new());
        let (surface, window) = map_toplevel(&mut state, app);

        let geometry_before = state.apps.window(window).unwrap().geometry;
        let buffer = state.surfaces.get(surface).unwrap().current.buffer.unwrap();

        // Null attach unmaps immediately but keeps the object
        state.surfaces.get_mut(surface).unwrap().attach(None, 0, 0);
        assert_eq!(state.commit(surface).unwrap(), MapState::Unmapped);
        assert!(!state.scene.contains(surface));
        // The compositor's hold dropped, so the client got a release
        assert_eq!(state.buffers.holds(buffer), 0);

        // Re-attach the same buffer: back to Mapped with identical geometry
        state.surfaces.get_mut(surface).unwrap().attach(Some(buffer), 0, 0);
        assert_eq!(state.commit(surface).unwrap(), MapState::Mapped);
        assert_eq!(state.apps.window(window).unwrap().geometry, geometry_before);
        assert!(state.scene.contains(surface));
    }

    #[test]
    fn test_at_most_one_frame_in_flight() {
        let (mut state, output) = state_with_output();
        let app = state.app_connected(ConnectionId::new());
        map_toplevel(&mut state, app);

        let mut backend = HeadlessBackend::new();
        assert!(state.render_output(output, &mut backend, 0).unwrap());
        assert_eq!(backend.frame_count(), 1);

        // Damaged again, but the first frame has not signalled done
        state.damage_output(output);
        assert!(!state.render_output(output, &mut backend, 16).unwrap());
        assert_eq!(backend.frame_count(), 1);

        state.frame_done(output);
        assert!(state.render_output(output, &mut backend, 32).unwrap());
        assert_eq!(backend.frame_count(), 2);
    }

    #[test]
    fn test_undamaged_output_not_composited() {
        let (mut state, output) = state_with_output();
        let app = state.app_connected(ConnectionId::new());
        map_toplevel(&mut state, app);

        let mut backend = HeadlessBackend::new();
        state.render_output(output, &mut backend, 0).unwrap();
        state.frame_done(output);

        // Nothing changed since the last frame
        assert!(!state.render_output(output, &mut backend, 16).unwrap());
        assert_eq!(backend.frame_count(), 1);
    }

    #[test]
    fn test_disconnect_unmaps_all_windows() {
        let (mut state, _output) = state_with_output();
        let app = state.app_connected(ConnectionId::new());

        let mut surfaces = Vec::new();
        for _ in 0..3 {
            let (surface, _) = map_toplevel(&mut state, app);
            surfaces.push(surface);
        }
        assert_eq!(state.scene.len(), 3);

        state.app_disconnected(app);
        assert!(state.scene.is_empty());
        assert!(state.apps.get(app).is_none());
        for surface in surfaces {
            assert!(state.surfaces.get(surface).is_none());
        }
    }

    #[test]
    fn test_frame_callbacks_fire_after_composite() {
        let (mut state, output) = state_with_output();
        let app = state.app_connected(ConnectionId::new());
        let (surface, _) = map_toplevel(&mut state, app);
        state.take_events();

        state.surfaces.get_mut(surface).unwrap().frame(77);
        state.surfaces.get_mut(surface).unwrap().damage(0, 0, 1, 1);
        state.commit(surface).unwrap();

        let mut backend = HeadlessBackend::new();
        state.render_output(output, &mut backend, 42).unwrap();
        let events = state.take_events();
        assert!(events.contains(&ServerEvent::FrameDone {
            surface,
            callback: 77,
            time_ms: 42,
        }));
    }

    #[test]
    fn test_in_flight_frame_holds_buffers() {
        let (mut state, output) = state_with_output();
        let app = state.app_connected(ConnectionId::new());
        let (surface, _) = map_toplevel(&mut state, app);
        let first = state.surfaces.get(surface).unwrap().current.buffer.unwrap();

        let mut backend = HeadlessBackend::new();
        state.render_output(output, &mut backend, 0).unwrap();
        // Commit hold + frame hold
        assert_eq!(state.buffers.holds(first), 2);

        // The client swaps buffers while the frame is still in flight
        let second = test_buffer(&mut state, 100, 100);
        state.surfaces.get_mut(surface).unwrap().attach(Some(second), 0, 0);
        state.commit(surface).unwrap();
        // Commit hold moved to the new buffer; the frame still reads the old
        assert_eq!(state.buffers.holds(first), 1);
        let events = state.take_events();
        assert!(!events.contains(&ServerEvent::BufferRelease { buffer: first }));

        state.frame_done(output);
        assert_eq!(state.buffers.holds(first), 0);
        let events = state.take_events();
        assert!(events.contains(&ServerEvent::BufferRelease { buffer: first }));
    }

    #[test]
    fn test_role_conflict_is_protocol_error() {
        let (mut state, _output) = state_with_output();
        let app = state.app_connected(ConnectionId::new());
        let surface = state.create_surface(Some(app));
        state.create_toplevel(app, surface).unwrap();

        let err = state.set_cursor(app, Some(surface), 0, 0).unwrap_err();
        assert_eq!(err, CommitError::RoleConflict);
    }

    #[test]
    fn test_popup_requires_mapped_parent() {
        let (mut state, _output) = state_with_output();
        let app = state.app_connected(ConnectionId::new());

        let parent = state.create_surface(Some(app));
        state.create_toplevel(app, parent).unwrap();
        // Parent is not mapped yet

        let popup = state.create_surface(Some(app));
        state
            .create_popup(popup, parent, Rect::new(10, 10, 50, 50))
            .unwrap();
        state.commit(popup).unwrap();
        let serial = last_configure_serial(&mut state, popup);
        state.ack_configure(popup, serial).unwrap();

        let buffer = test_buffer(&mut state, 50, 50);
        state.surfaces.get_mut(popup).unwrap().attach(Some(buffer), 0, 0);
        assert_eq!(
            state.commit(popup).unwrap_err(),
            CommitError::ParentNotMapped
        );
    }

    #[test]
    fn test_popup_maps_relative_to_parent() {
        let (mut state, _output) = state_with_output();
        let app = state.app_connected(ConnectionId::new());
        let (parent, _) = map_toplevel(&mut state, app);

        let popup = state.create_surface(Some(app));
        state
            .create_popup(popup, parent, Rect::new(20, 30, 50, 50))
            .unwrap();
        state.commit(popup).unwrap();
        let serial = last_configure_serial(&mut state, popup);
        state.ack_configure(popup, serial).unwrap();

        let buffer = test_buffer(&mut state, 50, 50);
        state.surfaces.get_mut(popup).unwrap().attach(Some(buffer), 0, 0);
        assert_eq!(state.commit(popup).unwrap(), MapState::Mapped);

        let parent_pos = state.scene.element(parent).unwrap().position;
        let popup_pos = state.scene.element(popup).unwrap().position;
        assert_eq!(popup_pos, (parent_pos.0 + 20, parent_pos.1 + 30));
    }

    #[test]
    fn test_popup_unmaps_with_parent() {
        let (mut state, _output) = state_with_output();
        let app = state.app_connected(ConnectionId::new());
        let (parent, _) = map_toplevel(&mut state, app);

        let popup = state.create_surface(Some(app));
        state
            .create_popup(popup, parent, Rect::new(0, 0, 50, 50))
            .unwrap();
        state.commit(popup).unwrap();
        let serial = last_configure_serial(&mut state, popup);
        state.ack_configure(popup, serial).unwrap();
        let buffer = test_buffer(&mut state, 50, 50);
        state.surfaces.get_mut(popup).unwrap().attach(Some(buffer), 0, 0);
        state.commit(popup).unwrap();
        assert!(state.scene.contains(popup));

        // Parent unmaps: the popup leaves the scene with it
        state.surfaces.get_mut(parent).unwrap().attach(None, 0, 0);
        state.commit(parent).unwrap();
        assert!(!state.scene.contains(popup));
    }

    #[test]
    fn test_output_removal_rehomes_surfaces() {
        let (mut state, first) = state_with_output();
        let mut second_output =
            Output::new("headless-2".into(), "Nacre".into(), "Virtual".into());
        second_output.add_mode(OutputMode {
            width: 1280,
            height: 720,
            refresh: 60_000,
            preferred: true,
        });
        let second = state.add_output(second_output);

        let app = state.app_connected(ConnectionId::new());
        let (surface, _) = map_toplevel(&mut state, app);
        assert_eq!(state.scene.element(surface).unwrap().output, first);

        state.remove_output(first);
        // Re-homed, still mapped
        assert_eq!(state.scene.element(surface).unwrap().output, second);
        assert_eq!(
            state.surfaces.get(surface).unwrap().map_state,
            MapState::Mapped
        );

        state.remove_output(second);
        // Nowhere left to show it: unmapped, never a crash
        assert!(!state.scene.contains(surface));
        assert_eq!(
            state.surfaces.get(surface).unwrap().map_state,
            MapState::Unmapped
        );
    }

    #[test]
    fn test_click_to_focus_activates_window() {
        let (mut state, _output) = state_with_output();
        let app = state.app_connected(ConnectionId::new());
        let (surface, window) = map_toplevel(&mut state, app);
        state.seat.attach_pointer();
        state.take_events();

        state.pointer_motion(1, 10.0, 10.0);
        let (_, keyboard_events) = state.pointer_button(None, 2, 0x110, true);

        assert!(state.apps.window(window).unwrap().is_activated());
        assert_eq!(state.apps.focused(), Some(app));
        assert_eq!(state.seat.keyboard_focus(), Some(surface));
        assert!(keyboard_events
            .iter()
            .any(|e| matches!(e, KeyboardEvent::Enter { surface: s, .. } if *s == surface)));
        // The activation was advertised through a configure
        let events = state.take_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, ServerEvent::Configure { window: w, .. } if *w == window)));
    }

    #[test]
    fn test_cursor_ownership_follows_set_cursor() {
        let (mut state, _output) = state_with_output();
        let a = state.app_connected(ConnectionId::new());
        let b = state.app_connected(ConnectionId::new());

        let cursor = state.create_surface(Some(a));
        state.set_cursor(a, Some(cursor), 4, 4).unwrap();
        assert!(state.apps.get(a).unwrap().mouse_cursor_connected());
        assert!(!state.apps.get(b).unwrap().mouse_cursor_connected());

        state.set_cursor(a, None, 0, 0).unwrap();
        assert!(!state.apps.get(a).unwrap().mouse_cursor_connected());
    }
}
