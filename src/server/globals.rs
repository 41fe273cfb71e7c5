//! Global registry and xdg-shell dispatch implementations
//!
//! GlobalDispatch advertises the protocol globals to clients; the xdg_*
//! object handlers drive role assignment and the configure/ack handshake in
//! the compositor core.

use std::sync::Mutex;

use log::{debug, warn};
use wayland_protocols::xdg::shell::server::{
    xdg_popup, xdg_positioner, xdg_surface, xdg_toplevel, xdg_wm_base,
};
use wayland_server::protocol::{wl_compositor, wl_output, wl_seat, wl_shm};
use wayland_server::{Client, DataInit, Dispatch, GlobalDispatch, New, Resource};

use crate::compositor::surface::{CommitError, SurfaceId};
use crate::compositor::window::{WindowId, WindowStateFlags};
use crate::input::pointer::GrabType;
use crate::protocol::shell::{Anchor, Gravity, Positioner};

use super::dispatch::{OutputData, SeatData};
use super::ServerState;

// ============================================================================
// wl_compositor global
// ============================================================================

impl GlobalDispatch<wl_compositor::WlCompositor, ()> for ServerState {
    fn bind(
        _state: &mut Self,
        _handle: &wayland_server::DisplayHandle,
        _client: &Client,
        resource: New<wl_compositor::WlCompositor>,
        _global_data: &(),
        data_init: &mut DataInit<'_, Self>,
    ) {
        debug!("Client bound wl_compositor");
        data_init.init(resource, ());
    }
}

// ============================================================================
// wl_shm global
// ============================================================================

impl GlobalDispatch<wl_shm::WlShm, ()> for ServerState {
    fn bind(
        state: &mut Self,
        _handle: &wayland_server::DisplayHandle,
        _client: &Client,
        resource: New<wl_shm::WlShm>,
        _global_data: &(),
        data_init: &mut DataInit<'_, Self>,
    ) {
        debug!("Client bound wl_shm");
        let shm = data_init.init(resource, ());

        for format in state.shm.formats() {
            shm.format(wl_shm::Format::try_from(format.to_wayland()).unwrap_or(wl_shm::Format::Argb8888));
        }
    }
}

// ============================================================================
// wl_seat global
// ============================================================================

impl GlobalDispatch<wl_seat::WlSeat, ()> for ServerState {
    fn bind(
        state: &mut Self,
        _handle: &wayland_server::DisplayHandle,
        _client: &Client,
        resource: New<wl_seat::WlSeat>,
        _global_data: &(),
        data_init: &mut DataInit<'_, Self>,
    ) {
        debug!("Client bound wl_seat");

        let caps = state.compositor.seat.capabilities();
        let mut capabilities = wl_seat::Capability::empty();
        if caps.keyboard {
            capabilities |= wl_seat::Capability::Keyboard;
        }
        if caps.pointer {
            capabilities |= wl_seat::Capability::Pointer;
        }

        let seat = data_init.init(resource, SeatData { capabilities });
        seat.capabilities(capabilities);
        if seat.version() >= 2 {
            seat.name(state.compositor.seat.name().to_string());
        }
    }
}

// ============================================================================
// wl_output global
// ============================================================================

impl GlobalDispatch<wl_output::WlOutput, ()> for ServerState {
    fn bind(
        state: &mut Self,
        _handle: &wayland_server::DisplayHandle,
        _client: &Client,
        resource: New<wl_output::WlOutput>,
        _global_data: &(),
        data_init: &mut DataInit<'_, Self>,
    ) {
        debug!("Client bound wl_output");

        let Some(output_id) = state.compositor.outputs.primary() else {
            // No outputs yet; serve the object with a placeholder id
            data_init.init(
                resource,
                OutputData {
                    output_id: crate::compositor::output::OutputId(0),
                },
            );
            return;
        };

        let output = data_init.init(resource, OutputData { output_id });

        if let Some(record) = state.compositor.outputs.get(output_id) {
            output.geometry(
                record.geometry.x,
                record.geometry.y,
                record.physical_size.0 as i32,
                record.physical_size.1 as i32,
                wl_output::Subpixel::Unknown,
                record.make.clone(),
                record.model.clone(),
                wl_output::Transform::Normal,
            );
            if let Some(mode) = record.current_mode() {
                output.mode(
                    wl_output::Mode::Current | wl_output::Mode::Preferred,
                    mode.width as i32,
                    mode.height as i32,
                    mode.refresh as i32,
                );
            }
            if output.version() >= 2 {
                output.scale(record.scale);
            }
            if output.version() >= 4 {
                output.name(record.name.clone());
                output.description(format!("{} {}", record.make, record.model));
            }
            if output.version() >= 2 {
                output.done();
            }
        }
    }
}

// ============================================================================
// xdg_wm_base global
// ============================================================================

impl GlobalDispatch<xdg_wm_base::XdgWmBase, ()> for ServerState {
    fn bind(
        _state: &mut Self,
        _handle: &wayland_server::DisplayHandle,
        _client: &Client,
        resource: New<xdg_wm_base::XdgWmBase>,
        _global_data: &(),
        data_init: &mut DataInit<'_, Self>,
    ) {
        debug!("Client bound xdg_wm_base");
        data_init.init(resource, ());
    }
}

impl Dispatch<xdg_wm_base::XdgWmBase, ()> for ServerState {
    fn request(
        state: &mut Self,
        _client: &Client,
        _resource: &xdg_wm_base::XdgWmBase,
        request: xdg_wm_base::Request,
        _data: &(),
        _dhandle: &wayland_server::DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            xdg_wm_base::Request::CreatePositioner { id } => {
                data_init.init(id, PositionerData::default());
            }
            xdg_wm_base::Request::GetXdgSurface { id, surface } => {
                let Some(surface_id) = surface.data::<SurfaceId>().copied() else {
                    return;
                };
                let xdg = data_init.init(id, XdgSurfaceData { surface: surface_id });
                state.resources.xdg_surfaces.insert(surface_id, xdg);
                debug!("Created xdg_surface for {:?}", surface_id);
            }
            xdg_wm_base::Request::Pong { serial } => {
                debug!("Received pong for serial {}", serial);
            }
            xdg_wm_base::Request::Destroy => {}
            _ => {}
        }
    }
}

// ============================================================================
// xdg_positioner
// ============================================================================

/// Positioner rules accumulate across requests; wayland user data is shared,
/// so the interior is locked
#[derive(Debug, Default)]
pub struct PositionerData {
    rules: Mutex<Positioner>,
}

impl PositionerData {
    pub fn snapshot(&self) -> Positioner {
        self.rules.lock().unwrap().clone()
    }
}

impl Dispatch<xdg_positioner::XdgPositioner, PositionerData> for ServerState {
    fn request(
        _state: &mut Self,
        _client: &Client,
        _resource: &xdg_positioner::XdgPositioner,
        request: xdg_positioner::Request,
        data: &PositionerData,
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        let mut rules = data.rules.lock().unwrap();
        match request {
            xdg_positioner::Request::SetSize { width, height } => {
                rules.set_size(width, height);
            }
            xdg_positioner::Request::SetAnchorRect {
                x,
                y,
                width,
                height,
            } => {
                rules.set_anchor_rect(x, y, width, height);
            }
            xdg_positioner::Request::SetAnchor { anchor } => {
                if let wayland_server::WEnum::Value(value) = anchor {
                    rules.set_anchor(Anchor::from_wayland(value as u32));
                }
            }
            xdg_positioner::Request::SetGravity { gravity } => {
                if let wayland_server::WEnum::Value(value) = gravity {
                    rules.set_gravity(Gravity::from_wayland(value as u32));
                }
            }
            xdg_positioner::Request::SetConstraintAdjustment {
                constraint_adjustment,
            } => {
                rules.set_constraint_adjustment(constraint_adjustment.into());
            }
            xdg_positioner::Request::SetOffset { x, y } => {
                rules.set_offset(x, y);
            }
            xdg_positioner::Request::Destroy => {}
            _ => {}
        }
    }
}

// ============================================================================
// xdg_surface
// ============================================================================

/// XDG surface data
pub struct XdgSurfaceData {
    pub surface: SurfaceId,
}

impl Dispatch<xdg_surface::XdgSurface, XdgSurfaceData> for ServerState {
    fn request(
        state: &mut Self,
        client: &Client,
        resource: &xdg_surface::XdgSurface,
        request: xdg_surface::Request,
        data: &XdgSurfaceData,
        _dhandle: &wayland_server::DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            xdg_surface::Request::GetToplevel { id } => {
                let Some(app) = state.app_for(client) else {
                    return;
                };
                match state.compositor.create_toplevel(app, data.surface) {
                    Ok(window) => {
                        let toplevel = data_init.init(
                            id,
                            ToplevelData {
                                surface: data.surface,
                                window,
                            },
                        );
                        state.resources.toplevels.insert(window, toplevel);
                        debug!(
                            "Created toplevel {:?} for surface {:?}",
                            window, data.surface
                        );
                    }
                    Err(err) => {
                        warn!("get_toplevel rejected: {}", err);
                        resource
                            .post_error(xdg_surface::Error::AlreadyConstructed, err.to_string());
                    }
                }
            }
            xdg_surface::Request::GetPopup {
                id,
                parent,
                positioner,
            } => {
                let Some(parent_surface) =
                    parent.as_ref().and_then(|p| p.data::<XdgSurfaceData>())
                else {
                    warn!("get_popup without a parent");
                    resource.post_error(
                        xdg_wm_base::Error::InvalidPopupParent,
                        "popup requires a parent surface",
                    );
                    return;
                };
                let geometry = positioner
                    .data::<PositionerData>()
                    .map(|p| p.snapshot().geometry())
                    .unwrap_or_default();

                match state
                    .compositor
                    .create_popup(data.surface, parent_surface.surface, geometry)
                {
                    Ok(()) => {
                        let popup = data_init.init(id, PopupData { surface: data.surface });
                        state.resources.popups.insert(data.surface, popup);
                        debug!(
                            "Created popup for surface {:?}, parent {:?}",
                            data.surface, parent_surface.surface
                        );
                    }
                    Err(err) => {
                        warn!("get_popup rejected: {}", err);
                        let code = match err {
                            CommitError::RoleConflict => {
                                xdg_surface::Error::AlreadyConstructed as u32
                            }
                            _ => xdg_wm_base::Error::InvalidPopupParent as u32,
                        };
                        resource.post_error(code, err.to_string());
                    }
                }
            }
            xdg_surface::Request::SetWindowGeometry {
                x,
                y,
                width,
                height,
            } => {
                debug!(
                    "Surface {:?} window geometry ({}, {}, {}, {})",
                    data.surface, x, y, width, height
                );
            }
            xdg_surface::Request::AckConfigure { serial } => {
                let was_mapped = state.compositor.scene.contains(data.surface);
                match state.compositor.ack_configure(data.surface, serial) {
                    Ok(_) => {
                        if !was_mapped && state.compositor.scene.contains(data.surface) {
                            debug!("Surface {:?} mapped on ack", data.surface);
                            state.focus_on_map(data.surface);
                        }
                    }
                    Err(err) => {
                        resource.post_error(xdg_surface::Error::InvalidSerial, err.to_string());
                    }
                }
            }
            xdg_surface::Request::Destroy => {
                state.resources.xdg_surfaces.remove(&data.surface);
            }
            _ => {}
        }
    }
}

// ============================================================================
// xdg_toplevel
// ============================================================================

/// Toplevel window data
pub struct ToplevelData {
    pub surface: SurfaceId,
    pub window: WindowId,
}

impl Dispatch<xdg_toplevel::XdgToplevel, ToplevelData> for ServerState {
    fn request(
        state: &mut Self,
        client: &Client,
        _resource: &xdg_toplevel::XdgToplevel,
        request: xdg_toplevel::Request,
        data: &ToplevelData,
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            xdg_toplevel::Request::SetTitle { title } => {
                if let Some(window) = state.compositor.apps.window_mut(data.window) {
                    window.set_title(title.clone());
                }
                if let Some(app) = state.app_for(client) {
                    if let Some(record) = state.compositor.apps.get_mut(app) {
                        if record.display_name.is_none() {
                            record.display_name = Some(title);
                        }
                    }
                }
            }
            xdg_toplevel::Request::SetAppId { app_id } => {
                if let Some(app) = state.app_for(client) {
                    if let Some(record) = state.compositor.apps.get_mut(app) {
                        debug!("App {:?} identifies as {}", app, app_id);
                        record.bundle_id = Some(app_id);
                    }
                }
            }
            xdg_toplevel::Request::SetParent { parent } => {
                let parent_window = parent
                    .as_ref()
                    .and_then(|p| p.data::<ToplevelData>())
                    .map(|d| d.window);
                if let Some(window) = state.compositor.apps.window_mut(data.window) {
                    window.parent = parent_window;
                }
            }
            xdg_toplevel::Request::SetMinSize { width, height } => {
                if let Some(window) = state.compositor.apps.window_mut(data.window) {
                    window.set_min_size(width.max(0) as u32, height.max(0) as u32);
                }
            }
            xdg_toplevel::Request::SetMaxSize { width, height } => {
                if let Some(window) = state.compositor.apps.window_mut(data.window) {
                    window.set_max_size(width.max(0) as u32, height.max(0) as u32);
                }
            }
            xdg_toplevel::Request::SetMaximized => {
                set_window_state(state, data, WindowStateFlags::MAXIMIZED, true);
            }
            xdg_toplevel::Request::UnsetMaximized => {
                set_window_state(state, data, WindowStateFlags::MAXIMIZED, false);
            }
            xdg_toplevel::Request::SetFullscreen { output: _ } => {
                set_window_state(state, data, WindowStateFlags::FULLSCREEN, true);
            }
            xdg_toplevel::Request::UnsetFullscreen => {
                set_window_state(state, data, WindowStateFlags::FULLSCREEN, false);
            }
            xdg_toplevel::Request::SetMinimized => {
                debug!("Toplevel {:?} requested minimize", data.window);
            }
            xdg_toplevel::Request::Move { seat: _, serial: _ } => {
                debug!("Toplevel {:?} interactive move", data.window);
            }
            xdg_toplevel::Request::Resize {
                seat: _,
                serial: _,
                edges,
            } => {
                debug!("Toplevel {:?} interactive resize {:?}", data.window, edges);
            }
            xdg_toplevel::Request::ShowWindowMenu {
                seat: _,
                serial: _,
                x,
                y,
            } => {
                debug!("Toplevel {:?} window menu at ({}, {})", data.window, x, y);
            }
            xdg_toplevel::Request::Destroy => {
                state.compositor.remove_window(data.window);
                state.resources.toplevels.remove(&data.window);
            }
            _ => {}
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: wayland_server::backend::ClientId,
        _resource: &xdg_toplevel::XdgToplevel,
        data: &ToplevelData,
    ) {
        state.compositor.remove_window(data.window);
        state.resources.toplevels.remove(&data.window);
    }
}

/// Toggle a window state flag and advertise it through a configure
fn set_window_state(
    state: &mut ServerState,
    data: &ToplevelData,
    flag: WindowStateFlags,
    value: bool,
) {
    // Fullscreen/maximized windows get the output size; restored ones pick
    // their own again
    let size = if value {
        state
            .compositor
            .scene
            .element(data.surface)
            .and_then(|e| state.compositor.outputs.get(e.output))
            .or_else(|| {
                state
                    .compositor
                    .outputs
                    .primary()
                    .and_then(|id| state.compositor.outputs.get(id))
            })
            .map(|o| (o.width(), o.height()))
            .unwrap_or((0, 0))
    } else {
        (0, 0)
    };

    let changed = state
        .compositor
        .apps
        .window_mut(data.window)
        .map(|w| w.set_state(flag, value))
        .unwrap_or(false);
    if changed {
        state.compositor.send_configure(data.surface, size);
    }
}

// ============================================================================
// xdg_popup
// ============================================================================

/// Popup data
pub struct PopupData {
    pub surface: SurfaceId,
}

impl Dispatch<xdg_popup::XdgPopup, PopupData> for ServerState {
    fn request(
        state: &mut Self,
        _client: &Client,
        _resource: &xdg_popup::XdgPopup,
        request: xdg_popup::Request,
        data: &PopupData,
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            xdg_popup::Request::Grab { seat: _, serial } => {
                state.compositor.seat.pointer_mut().start_grab(
                    data.surface,
                    None,
                    serial,
                    GrabType::Popup,
                );
                debug!("Popup {:?} grabbed the pointer", data.surface);
            }
            xdg_popup::Request::Reposition {
                positioner,
                token: _,
            } => {
                if let Some(geometry) = positioner
                    .data::<PositionerData>()
                    .map(|p| p.snapshot().geometry())
                {
                    state.compositor.reposition_popup(data.surface, geometry);
                }
            }
            xdg_popup::Request::Destroy => {
                state.compositor.dismiss_popup(data.surface);
                state.resources.popups.remove(&data.surface);
            }
            _ => {}
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: wayland_server::backend::ClientId,
        _resource: &xdg_popup::XdgPopup,
        data: &PopupData,
    ) {
        state.compositor.dismiss_popup(data.surface);
        state.resources.popups.remove(&data.surface);
    }
}
