//! Application records and the app/window registry
//!
//! Each connected client is one [`AppRecord`]: the authoritative mapping
//! from client-visible identifiers to compositor-internal window state, used
//! by focus management and the task switcher. The record exclusively owns
//! its windows; everything else refers to them by id.
//!
//! Registry operations never perform I/O. A dead connection is detected by
//! the server layer and surfaced as a single teardown call into
//! [`AppRegistry::remove_app`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;

use crate::compositor::surface::SurfaceId;
use crate::compositor::window::{WindowId, WindowRecord};

/// Unique identifier for application records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AppId(pub u64);

impl AppId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        AppId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Opaque token for the underlying client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        ConnectionId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

/// ARGB icon payload supplied by the client
#[derive(Debug, Clone)]
pub struct AppIcon {
    pub width: u32,
    pub height: u32,
    pub argb: Vec<u8>,
}

/// Errors from registry operations that signal client misbehavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("window id already registered")]
    DuplicateWindow,
    #[error("window belongs to a different application")]
    ForeignWindow,
    #[error("unknown application")]
    UnknownApp,
}

/// One connected client application
#[derive(Debug)]
pub struct AppRecord {
    pub id: AppId,
    /// Connection handle; identity of the client socket
    pub connection: ConnectionId,
    /// Reverse-DNS bundle identifier, from the shell app-id
    pub bundle_id: Option<String>,
    pub pid: Option<i32>,
    pub display_name: Option<String>,
    pub icon: Option<AppIcon>,
    /// Owned windows, in creation order
    windows: Vec<WindowRecord>,
    /// Whether this app currently owns cursor rendering
    mouse_cursor_connected: bool,
}

impl AppRecord {
    fn new(connection: ConnectionId) -> Self {
        Self {
            id: AppId::new(),
            connection,
            bundle_id: None,
            pid: None,
            display_name: None,
            icon: None,
            windows: Vec::new(),
            mouse_cursor_connected: false,
        }
    }

    /// Append a window to the owned list
    ///
    /// Rejects a duplicate id (a protocol violation, never a silent
    /// overwrite) and a window whose owner back-reference is not this app.
    pub fn add_window(&mut self, window: WindowRecord) -> Result<(), RegistryError> {
        if window.app != self.id {
            return Err(RegistryError::ForeignWindow);
        }
        if self.windows.iter().any(|w| w.id == window.id) {
            return Err(RegistryError::DuplicateWindow);
        }
        self.windows.push(window);
        Ok(())
    }

    /// Remove and return a window for destruction; idempotent
    ///
    /// A client may race a close request against a server-initiated
    /// teardown, so absence is a no-op rather than an error.
    pub fn remove_window(&mut self, id: WindowId) -> Option<WindowRecord> {
        let pos = self.windows.iter().position(|w| w.id == id)?;
        Some(self.windows.remove(pos))
    }

    /// Non-owning lookup; absence is a normal outcome
    pub fn window(&self, id: WindowId) -> Option<&WindowRecord> {
        self.windows.iter().find(|w| w.id == id)
    }

    pub fn window_mut(&mut self, id: WindowId) -> Option<&mut WindowRecord> {
        self.windows.iter_mut().find(|w| w.id == id)
    }

    /// Drain every window for disconnect teardown
    ///
    /// The caller must force-unmap each returned window (scene and output
    /// notification) before dropping the record, so no surface reference
    /// survives the app.
    pub fn take_windows(&mut self) -> Vec<WindowRecord> {
        std::mem::take(&mut self.windows)
    }

    pub fn windows(&self) -> &[WindowRecord] {
        &self.windows
    }

    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    /// Track cursor-rendering ownership for this app
    pub fn set_mouse_cursor_connected(&mut self, connected: bool) {
        self.mouse_cursor_connected = connected;
    }

    pub fn mouse_cursor_connected(&self) -> bool {
        self.mouse_cursor_connected
    }
}

/// Registry of all connected applications
///
/// Keeps the task-switcher ordering and the reverse indices from window and
/// surface ids back to the owning app.
#[derive(Debug, Default)]
pub struct AppRegistry {
    apps: HashMap<AppId, AppRecord>,
    /// Task-switcher order: most recently connected last
    order: Vec<AppId>,
    focused: Option<AppId>,
    window_index: HashMap<WindowId, AppId>,
    surface_index: HashMap<SurfaceId, (AppId, WindowId)>,
}

impl AppRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new client connection as an application record
    pub fn connect(&mut self, connection: ConnectionId) -> AppId {
        let record = AppRecord::new(connection);
        let id = record.id;
        self.order.push(id);
        self.apps.insert(id, record);
        debug!("App {:?} connected ({:?})", id, connection);
        id
    }

    pub fn get(&self, id: AppId) -> Option<&AppRecord> {
        self.apps.get(&id)
    }

    pub fn get_mut(&mut self, id: AppId) -> Option<&mut AppRecord> {
        self.apps.get_mut(&id)
    }

    /// Find an app by its bundle identifier
    pub fn by_bundle_id(&self, bundle_id: &str) -> Option<&AppRecord> {
        self.apps
            .values()
            .find(|a| a.bundle_id.as_deref() == Some(bundle_id))
    }

    /// Add a window under its owning app and index it
    pub fn add_window(&mut self, window: WindowRecord) -> Result<WindowId, RegistryError> {
        let app_id = window.app;
        let window_id = window.id;
        let surface = window.surface;
        let app = self.apps.get_mut(&app_id).ok_or(RegistryError::UnknownApp)?;
        app.add_window(window)?;
        self.window_index.insert(window_id, app_id);
        self.surface_index.insert(surface, (app_id, window_id));
        Ok(window_id)
    }

    /// Remove one window; idempotent
    pub fn remove_window(&mut self, id: WindowId) -> Option<WindowRecord> {
        let app_id = self.window_index.remove(&id)?;
        let window = self.apps.get_mut(&app_id)?.remove_window(id)?;
        self.surface_index.remove(&window.surface);
        Some(window)
    }

    /// Look up a window anywhere in the registry
    pub fn window(&self, id: WindowId) -> Option<&WindowRecord> {
        let app_id = self.window_index.get(&id)?;
        self.apps.get(app_id)?.window(id)
    }

    pub fn window_mut(&mut self, id: WindowId) -> Option<&mut WindowRecord> {
        let app_id = self.window_index.get(&id)?;
        self.apps.get_mut(app_id)?.window_mut(id)
    }

    /// The window backed by a surface, if any
    pub fn window_for_surface(&self, surface: SurfaceId) -> Option<(AppId, WindowId)> {
        self.surface_index.get(&surface).copied()
    }

    /// Tear down an application record at disconnect
    ///
    /// Returns the drained windows so the caller can force-unmap each one
    /// before the record is gone. Runs at most once per app.
    pub fn remove_app(&mut self, id: AppId) -> Vec<WindowRecord> {
        let Some(mut record) = self.apps.remove(&id) else {
            return Vec::new();
        };
        self.order.retain(|a| *a != id);
        if self.focused == Some(id) {
            self.focused = None;
        }
        let windows = record.take_windows();
        for window in &windows {
            self.window_index.remove(&window.id);
            self.surface_index.remove(&window.surface);
        }
        debug!(
            "App {:?} removed, {} window(s) drained for unmap",
            id,
            windows.len()
        );
        windows
    }

    /// Give one app cursor-rendering ownership, clearing all others
    pub fn set_cursor_owner(&mut self, id: Option<AppId>) {
        for (app_id, record) in self.apps.iter_mut() {
            record.set_mouse_cursor_connected(Some(*app_id) == id);
        }
    }

    pub fn set_focused(&mut self, id: Option<AppId>) {
        self.focused = id;
    }

    pub fn focused(&self) -> Option<AppId> {
        self.focused
    }

    /// Apps in task-switcher order
    pub fn ordered(&self) -> impl Iterator<Item = &AppRecord> {
        self.order.iter().filter_map(|id| self.apps.get(id))
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_app() -> (AppRegistry, AppId) {
        let mut registry = AppRegistry::new();
        let app = registry.connect(ConnectionId::new());
        (registry, app)
    }

    #[test]
    fn test_connect_assigns_unique_apps() {
        let mut registry = AppRegistry::new();
        let a = registry.connect(ConnectionId::new());
        let b = registry.connect(ConnectionId::new());
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_duplicate_window_rejected() {
        let (mut registry, app) = registry_with_app();
        let window = WindowRecord::new(app, SurfaceId(1));
        let id = window.id;
        registry.add_window(window).unwrap();

        // Same id again must be rejected, not overwritten
        let mut dup = WindowRecord::new(app, SurfaceId(2));
        dup.id = id;
        assert_eq!(
            registry.get_mut(app).unwrap().add_window(dup),
            Err(RegistryError::DuplicateWindow)
        );
        assert_eq!(registry.get(app).unwrap().window_count(), 1);
    }

    #[test]
    fn test_foreign_window_rejected() {
        let (mut registry, app) = registry_with_app();
        let other = registry.connect(ConnectionId::new());
        let window = WindowRecord::new(other, SurfaceId(1));
        assert_eq!(
            registry.get_mut(app).unwrap().add_window(window),
            Err(RegistryError::ForeignWindow)
        );
    }

    #[test]
    fn test_remove_window_idempotent() {
        let (mut registry, app) = registry_with_app();
        let window = WindowRecord::new(app, SurfaceId(1));
        let id = registry.add_window(window).unwrap();

        assert!(registry.remove_window(id).is_some());
        // Second removal is a no-op, never an error
        assert!(registry.remove_window(id).is_none());
    }

    #[test]
    fn test_window_lookup_absence_is_normal() {
        let (registry, _app) = registry_with_app();
        assert!(registry.window(WindowId(424242)).is_none());
    }

    #[test]
    fn test_window_for_surface() {
        let (mut registry, app) = registry_with_app();
        let surface = SurfaceId(11);
        let window = WindowRecord::new(app, surface);
        let id = registry.add_window(window).unwrap();

        assert_eq!(registry.window_for_surface(surface), Some((app, id)));
        registry.remove_window(id);
        assert_eq!(registry.window_for_surface(surface), None);
    }

    #[test]
    fn test_remove_app_drains_all_windows() {
        let (mut registry, app) = registry_with_app();
        for i in 0..3 {
            let window = WindowRecord::new(app, SurfaceId(100 + i));
            registry.add_window(window).unwrap();
        }

        let windows = registry.remove_app(app);
        assert_eq!(windows.len(), 3);
        assert!(registry.get(app).is_none());
        // Indices are gone with the record
        assert!(registry.window_for_surface(SurfaceId(100)).is_none());
        // A second teardown is harmless
        assert!(registry.remove_app(app).is_empty());
    }

    #[test]
    fn test_cursor_ownership_is_exclusive() {
        let mut registry = AppRegistry::new();
        let a = registry.connect(ConnectionId::new());
        let b = registry.connect(ConnectionId::new());

        registry.set_cursor_owner(Some(a));
        assert!(registry.get(a).unwrap().mouse_cursor_connected());
        assert!(!registry.get(b).unwrap().mouse_cursor_connected());

        registry.set_cursor_owner(Some(b));
        assert!(!registry.get(a).unwrap().mouse_cursor_connected());
        assert!(registry.get(b).unwrap().mouse_cursor_connected());
    }

    #[test]
    fn test_focused_cleared_on_remove() {
        let (mut registry, app) = registry_with_app();
        registry.set_focused(Some(app));
        registry.remove_app(app);
        assert_eq!(registry.focused(), None);
    }

    #[test]
    fn test_bundle_id_lookup() {
        let (mut registry, app) = registry_with_app();
        registry.get_mut(app).unwrap().bundle_id = Some("com.example.app".into());
        assert_eq!(registry.by_bundle_id("com.example.app").unwrap().id, app);
        assert!(registry.by_bundle_id("com.example.other").is_none());
    }
}
