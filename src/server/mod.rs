//! Wayland server integration
//!
//! Owns the listening socket and the display, maps client connections to
//! application records, and drains the compositor's queued events onto the
//! wire after every dispatch round.
//!
//! A client disconnect is detected by the backend and queued as a teardown
//! token; the loop processes it after the client's remaining requests, never
//! concurrently with them.

mod dispatch;
mod event_loop;
mod globals;

use std::collections::HashMap;
use std::io::Write;
use std::os::unix::io::{AsFd, OwnedFd};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use calloop::generic::Generic;
use calloop::timer::{TimeoutAction, Timer};
use calloop::{Interest, Mode, PostAction};
use log::{debug, error, info};
use wayland_protocols::xdg::shell::server::{xdg_popup, xdg_surface, xdg_toplevel};
use wayland_server::backend::{ClientData, ClientId, DisconnectReason};
use wayland_server::protocol::{wl_buffer, wl_callback, wl_keyboard, wl_pointer, wl_surface};
use wayland_server::{Client, Display, ListeningSocket, Resource};

use crate::compositor::app::{AppId, ConnectionId};
use crate::compositor::buffer::BufferId;
use crate::compositor::state::ServerEvent;
use crate::compositor::surface::SurfaceId;
use crate::compositor::window::WindowId;
use crate::compositor::CompositorState;
use crate::input::seat::{ButtonState, KeyState, KeyboardEvent, PointerEvent};
use crate::protocol::shm::ShmState;
use crate::renderer::RenderBackend;

pub use dispatch::*;
pub use event_loop::EventLoop;
pub use globals::*;

/// Wire-object handles the server sends events through
///
/// The compositor core works purely with ids; this map turns them back into
/// protocol objects when queued events are flushed.
#[derive(Default)]
pub struct ResourceMap {
    pub surfaces: HashMap<SurfaceId, wl_surface::WlSurface>,
    pub xdg_surfaces: HashMap<SurfaceId, xdg_surface::XdgSurface>,
    pub toplevels: HashMap<WindowId, xdg_toplevel::XdgToplevel>,
    pub popups: HashMap<SurfaceId, xdg_popup::XdgPopup>,
    pub buffers: HashMap<BufferId, wl_buffer::WlBuffer>,
    pub callbacks: HashMap<u32, wl_callback::WlCallback>,
    pub keyboards: HashMap<AppId, Vec<wl_keyboard::WlKeyboard>>,
    pub pointers: HashMap<AppId, Vec<wl_pointer::WlPointer>>,
}

impl ResourceMap {
    /// Drop every handle belonging to a disconnected app
    fn remove_app(&mut self, app: AppId, compositor: &CompositorState) {
        self.keyboards.remove(&app);
        self.pointers.remove(&app);
        self.surfaces
            .retain(|id, _| compositor.surfaces.get(*id).is_some());
        self.xdg_surfaces
            .retain(|id, _| compositor.surfaces.get(*id).is_some());
        self.popups
            .retain(|id, _| compositor.surfaces.get(*id).is_some());
        self.toplevels
            .retain(|id, _| compositor.apps.window(*id).is_some());
    }
}

/// Per-connection data handed to the wayland backend
///
/// The disconnect callback runs on the dispatch thread; it only queues the
/// app id for teardown, which the loop performs after the client's already
/// queued requests.
pub struct ClientState {
    pub app: AppId,
    pub connection: ConnectionId,
    reaper: Arc<Mutex<Vec<AppId>>>,
}

impl ClientData for ClientState {
    fn initialized(&self, _client_id: ClientId) {
        debug!("Client initialized for app {:?}", self.app);
    }

    fn disconnected(&self, _client_id: ClientId, _reason: DisconnectReason) {
        debug!("Client for app {:?} disconnected", self.app);
        self.reaper.lock().unwrap().push(self.app);
    }
}

/// State passed to every protocol dispatch handler
pub struct ServerState {
    /// Compositor core: surfaces, apps, outputs, scene, seat
    pub compositor: CompositorState,
    /// SHM pools
    pub shm: ShmState,
    /// Wire-object handles
    pub resources: ResourceMap,
    /// Apps whose connection died, awaiting teardown
    reaper: Arc<Mutex<Vec<AppId>>>,
    /// Set when infrastructure is lost; the loop exits non-zero
    pub fatal: Option<String>,
    /// Server start, for event timestamps
    start: Instant,
}

impl ServerState {
    pub fn new() -> Self {
        Self {
            compositor: CompositorState::new(),
            shm: ShmState::new(),
            resources: ResourceMap::default(),
            reaper: Arc::new(Mutex::new(Vec::new())),
            fatal: None,
            start: Instant::now(),
        }
    }

    /// Milliseconds since server start, for input/frame timestamps
    pub fn timestamp_ms(&self) -> u32 {
        self.start.elapsed().as_millis() as u32
    }

    /// The application record behind a protocol client
    pub fn app_for(&self, client: &Client) -> Option<AppId> {
        client.get_data::<ClientState>().map(|c| c.app)
    }

    /// Tear down every app whose connection died
    pub fn reap_disconnected(&mut self) {
        let dead: Vec<AppId> = std::mem::take(&mut *self.reaper.lock().unwrap());
        for app in dead {
            self.compositor.app_disconnected(app);
            self.resources.remove_app(app, &self.compositor);
        }
    }

    /// A surface just mapped for the first time: give it focus
    pub fn focus_on_map(&mut self, surface: SurfaceId) {
        if let Some((_, window)) = self.compositor.apps.window_for_surface(surface) {
            let events = self.compositor.focus_window(window);
            self.send_keyboard_events(events);
        }
    }

    /// Flush queued compositor events onto the wire
    pub fn flush_queued_events(&mut self) {
        for event in self.compositor.take_events() {
            match event {
                ServerEvent::Configure {
                    surface,
                    window,
                    serial,
                    size,
                    states,
                } => {
                    if let Some(toplevel) = self.resources.toplevels.get(&window) {
                        toplevel.configure(size.0 as i32, size.1 as i32, states);
                    }
                    if let Some(xdg) = self.resources.xdg_surfaces.get(&surface) {
                        xdg.configure(serial);
                    }
                }
                ServerEvent::PopupConfigure {
                    surface,
                    serial,
                    geometry,
                } => {
                    if let Some(popup) = self.resources.popups.get(&surface) {
                        popup.configure(
                            geometry.x,
                            geometry.y,
                            geometry.width as i32,
                            geometry.height as i32,
                        );
                    }
                    if let Some(xdg) = self.resources.xdg_surfaces.get(&surface) {
                        xdg.configure(serial);
                    }
                }
                ServerEvent::BufferRelease { buffer } => {
                    if let Some(handle) = self.resources.buffers.get(&buffer) {
                        handle.release();
                    }
                }
                ServerEvent::FrameDone {
                    callback, time_ms, ..
                } => {
                    // One-shot objects; the handle is dropped with the send
                    if let Some(handle) = self.resources.callbacks.remove(&callback) {
                        handle.done(time_ms);
                    }
                }
            }
        }
    }

    /// Deliver keyboard events to the focused surface's client
    pub fn send_keyboard_events(&mut self, events: Vec<KeyboardEvent>) {
        for event in events {
            match event {
                KeyboardEvent::Enter {
                    surface,
                    pressed_keys,
                } => {
                    let serial = self.compositor.next_serial();
                    let keys: Vec<u8> = pressed_keys
                        .iter()
                        .flat_map(|k| k.to_le_bytes())
                        .collect();
                    if let Some(handle) = self.resources.surfaces.get(&surface) {
                        for keyboard in self.keyboards_for_surface(surface) {
                            keyboard.enter(serial, handle, keys.clone());
                        }
                    }
                }
                KeyboardEvent::Leave { surface } => {
                    let serial = self.compositor.next_serial();
                    if let Some(handle) = self.resources.surfaces.get(&surface) {
                        for keyboard in self.keyboards_for_surface(surface) {
                            keyboard.leave(serial, handle);
                        }
                    }
                }
                KeyboardEvent::Key { time, key, state } => {
                    let serial = self.compositor.next_serial();
                    let wire_state = match state {
                        KeyState::Pressed => wl_keyboard::KeyState::Pressed,
                        KeyState::Released => wl_keyboard::KeyState::Released,
                    };
                    for keyboard in self.focused_keyboards() {
                        keyboard.key(serial, time, key, wire_state);
                    }
                }
                KeyboardEvent::Modifiers(mods) => {
                    let serial = self.compositor.next_serial();
                    for keyboard in self.focused_keyboards() {
                        keyboard.modifiers(
                            serial,
                            mods.depressed,
                            mods.latched,
                            mods.locked,
                            mods.group,
                        );
                    }
                }
            }
        }
    }

    /// Deliver pointer events to the pointer-focused surface's client
    pub fn send_pointer_events(&mut self, events: Vec<PointerEvent>) {
        for event in events {
            match event {
                PointerEvent::Enter { surface, x, y } => {
                    let serial = self.compositor.next_serial();
                    if let Some(handle) = self.resources.surfaces.get(&surface) {
                        for pointer in self.pointers_for_surface(surface) {
                            pointer.enter(serial, handle, x, y);
                        }
                    }
                }
                PointerEvent::Leave { surface } => {
                    let serial = self.compositor.next_serial();
                    if let Some(handle) = self.resources.surfaces.get(&surface) {
                        for pointer in self.pointers_for_surface(surface) {
                            pointer.leave(serial, handle);
                        }
                    }
                }
                PointerEvent::Motion { time, x, y } => {
                    for pointer in self.focused_pointers() {
                        pointer.motion(time, x, y);
                    }
                }
                PointerEvent::Button {
                    time,
                    button,
                    state,
                } => {
                    let serial = self.compositor.next_serial();
                    let wire_state = match state {
                        ButtonState::Pressed => wl_pointer::ButtonState::Pressed,
                        ButtonState::Released => wl_pointer::ButtonState::Released,
                    };
                    for pointer in self.focused_pointers() {
                        pointer.button(serial, time, button, wire_state);
                    }
                }
                PointerEvent::Axis { time, axis, value } => {
                    let wire_axis = match axis {
                        crate::input::seat::AxisType::VerticalScroll => {
                            wl_pointer::Axis::VerticalScroll
                        }
                        crate::input::seat::AxisType::HorizontalScroll => {
                            wl_pointer::Axis::HorizontalScroll
                        }
                    };
                    for pointer in self.focused_pointers() {
                        pointer.axis(time, wire_axis, value);
                    }
                }
                PointerEvent::Frame => {
                    for pointer in self.focused_pointers() {
                        if pointer.version() >= 5 {
                            pointer.frame();
                        }
                    }
                }
            }
        }
    }

    fn keyboards_for_surface(&self, surface: SurfaceId) -> Vec<wl_keyboard::WlKeyboard> {
        self.compositor
            .surfaces
            .get(surface)
            .and_then(|s| s.owner)
            .and_then(|app| self.resources.keyboards.get(&app))
            .cloned()
            .unwrap_or_default()
    }

    fn focused_keyboards(&self) -> Vec<wl_keyboard::WlKeyboard> {
        self.compositor
            .seat
            .keyboard_focus()
            .map(|s| self.keyboards_for_surface(s))
            .unwrap_or_default()
    }

    fn pointers_for_surface(&self, surface: SurfaceId) -> Vec<wl_pointer::WlPointer> {
        self.compositor
            .surfaces
            .get(surface)
            .and_then(|s| s.owner)
            .and_then(|app| self.resources.pointers.get(&app))
            .cloned()
            .unwrap_or_default()
    }

    fn focused_pointers(&self) -> Vec<wl_pointer::WlPointer> {
        self.compositor
            .seat
            .pointer_focus()
            .map(|s| self.pointers_for_surface(s))
            .unwrap_or_default()
    }
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a sealed-enough memfd carrying the keymap text for wl_keyboard
pub(crate) fn keymap_fd(text: &str) -> std::io::Result<(OwnedFd, u32)> {
    let fd = rustix::fs::memfd_create("nacre-keymap", rustix::fs::MemfdFlags::CLOEXEC)
        .map_err(std::io::Error::from)?;
    let mut file = std::fs::File::from(fd);
    file.write_all(text.as_bytes())?;
    file.write_all(&[0])?;
    let size = text.len() as u32 + 1;
    Ok((OwnedFd::from(file), size))
}

/// The window server: socket, display, and the event loop
pub struct WindowServer {
    display: Display<ServerState>,
    socket: ListeningSocket,
    socket_name: String,
}

impl WindowServer {
    /// Bind the display socket and create the wayland display
    ///
    /// Failure here is infrastructure loss: the caller logs it and exits
    /// non-zero.
    pub fn new() -> anyhow::Result<Self> {
        info!("Creating window server display");

        let display: Display<ServerState> = Display::new()?;
        let socket = ListeningSocket::bind_auto("wayland", 0..33)?;
        let socket_name = socket
            .socket_name()
            .and_then(|n| n.to_str().map(String::from))
            .unwrap_or_else(|| "wayland-0".to_string());

        info!("Listening on {}", socket_name);

        Ok(Self {
            display,
            socket,
            socket_name,
        })
    }

    /// Socket name for WAYLAND_DISPLAY
    pub fn socket_name(&self) -> &str {
        &self.socket_name
    }

    pub fn display_handle(&self) -> wayland_server::DisplayHandle {
        self.display.handle()
    }

    /// Register every protocol global
    pub fn register_globals(&mut self) {
        let dh = self.display.handle();

        dh.create_global::<ServerState, wayland_server::protocol::wl_compositor::WlCompositor, _>(
            6,
            (),
        );
        dh.create_global::<ServerState, wayland_server::protocol::wl_shm::WlShm, _>(1, ());
        dh.create_global::<ServerState, wayland_server::protocol::wl_seat::WlSeat, _>(9, ());
        dh.create_global::<ServerState, wayland_server::protocol::wl_output::WlOutput, _>(4, ());
        dh.create_global::<ServerState, wayland_protocols::xdg::shell::server::xdg_wm_base::XdgWmBase, _>(6, ());

        info!("Registered globals: wl_compositor, wl_shm, wl_seat, wl_output, xdg_wm_base");
    }

    /// Run the server until infrastructure loss
    ///
    /// One thread, one loop: socket accepts, client traffic, and the frame
    /// clock are all calloop sources. Per-client FIFO ordering comes from
    /// the single dispatch path.
    pub fn run(
        mut self,
        mut state: ServerState,
        mut backend: Box<dyn RenderBackend>,
    ) -> anyhow::Result<()> {
        let mut event_loop: EventLoop<ServerState> = EventLoop::new()?;
        let handle = event_loop.handle();

        // Accept new connections; each one becomes an application record
        let socket = self.socket;
        let mut accept_dh = self.display.handle();
        handle.insert_source(
            Generic::new(
                socket.as_fd().try_clone_to_owned()?,
                Interest::READ,
                Mode::Level,
            ),
            move |_, _, state: &mut ServerState| {
                while let Some(stream) = socket.accept()? {
                    let connection = ConnectionId::new();
                    let app = state.compositor.app_connected(connection);
                    let data = Arc::new(ClientState {
                        app,
                        connection,
                        reaper: state.reaper.clone(),
                    });
                    match accept_dh.insert_client(stream, data) {
                        Ok(client) => {
                            if let Ok(credentials) = client.get_credentials(&accept_dh) {
                                if let Some(record) = state.compositor.apps.get_mut(app) {
                                    record.pid = Some(credentials.pid);
                                }
                            }
                            debug!("Accepted client as app {:?}", app);
                        }
                        Err(e) => {
                            error!("Failed to insert client: {}", e);
                            state.compositor.app_disconnected(app);
                        }
                    }
                }
                Ok(PostAction::Continue)
            },
        )?;

        // Wake the loop when client data arrives; draining happens below
        handle.insert_source(
            Generic::new(
                self.display.backend().poll_fd().try_clone_to_owned()?,
                Interest::READ,
                Mode::Level,
            ),
            |_, _, _: &mut ServerState| Ok(PostAction::Continue),
        )?;

        // Frame clock: each tick completes the previous frame and composites
        // damaged outputs, keeping at most one frame in flight per output
        let interval = Duration::from_millis(16);
        handle.insert_source(
            Timer::from_duration(interval),
            move |_, _, state: &mut ServerState| {
                let now = state.timestamp_ms();
                for id in state.compositor.outputs.ids() {
                    let pending = state
                        .compositor
                        .outputs
                        .get(id)
                        .map(|o| o.frame_pending())
                        .unwrap_or(false);
                    if pending {
                        state.compositor.frame_done(id);
                    }
                    if let Err(e) = state.compositor.render_output(id, backend.as_mut(), now) {
                        state.fatal = Some(format!("render backend lost: {e}"));
                    }
                }
                TimeoutAction::ToDuration(interval)
            },
        )
        .map_err(|e| anyhow::anyhow!("failed to insert frame timer: {e}"))?;

        info!("Window server running on {}", self.socket_name);

        loop {
            event_loop.dispatch(None, &mut state)?;
            self.display.dispatch_clients(&mut state)?;
            state.reap_disconnected();
            state.flush_queued_events();
            self.display.flush_clients()?;

            if let Some(reason) = state.fatal.take() {
                error!("Fatal: {}", reason);
                anyhow::bail!(reason);
            }
        }
    }

    /// Single-step dispatch without the loop (embedding and tests)
    pub fn dispatch(&mut self, state: &mut ServerState) -> anyhow::Result<()> {
        while let Some(stream) = self.socket.accept()? {
            let connection = ConnectionId::new();
            let app = state.compositor.app_connected(connection);
            let data = Arc::new(ClientState {
                app,
                connection,
                reaper: state.reaper.clone(),
            });
            if let Err(e) = self.display.handle().insert_client(stream, data) {
                error!("Failed to insert client: {}", e);
                state.compositor.app_disconnected(app);
            }
        }

        self.display.dispatch_clients(state)?;
        state.reap_disconnected();
        state.flush_queued_events();
        self.display.flush_clients()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keymap_fd_roundtrip() {
        let (fd, size) = keymap_fd("xkb_keymap { };").unwrap();
        assert_eq!(size, 16);
        let file = std::fs::File::from(fd);
        let mapped = unsafe { memmap2::Mmap::map(&file) }.unwrap();
        assert_eq!(&mapped[..size as usize - 1], b"xkb_keymap { };");
        assert_eq!(mapped[size as usize - 1], 0);
    }

    #[test]
    fn test_server_state_new() {
        let state = ServerState::new();
        assert!(state.compositor.apps.is_empty());
        assert!(state.fatal.is_none());
    }

    #[test]
    fn test_reap_is_idempotent() {
        let mut state = ServerState::new();
        let app = state.compositor.app_connected(ConnectionId::new());
        state.reaper.lock().unwrap().push(app);

        state.reap_disconnected();
        assert!(state.compositor.apps.get(app).is_none());
        // A second reap with an empty queue is a no-op
        state.reap_disconnected();
    }
}
