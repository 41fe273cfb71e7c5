//! Core protocol dispatch implementations
//!
//! Implements the Dispatch trait for the wl_* objects. Handlers translate
//! wire requests into compositor-core operations; client protocol
//! violations are posted back as protocol errors, terminating only the
//! offending connection.

use std::sync::Mutex;

use log::{debug, warn};
use wayland_server::protocol::{
    wl_buffer, wl_callback, wl_compositor, wl_keyboard, wl_output, wl_pointer, wl_region, wl_seat,
    wl_shm, wl_shm_pool, wl_surface, wl_touch,
};
use wayland_server::{Client, DataInit, Dispatch, Resource};

use crate::compositor::buffer::BufferId;
use crate::compositor::geometry::Region;
use crate::compositor::surface::{CommitError, MapState, SurfaceId};
use crate::protocol::shm::{ShmError, ShmPoolId};

use super::{keymap_fd, ServerState};

// ============================================================================
// wl_compositor
// ============================================================================

impl Dispatch<wl_compositor::WlCompositor, ()> for ServerState {
    fn request(
        state: &mut Self,
        client: &Client,
        _resource: &wl_compositor::WlCompositor,
        request: wl_compositor::Request,
        _data: &(),
        _dhandle: &wayland_server::DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            wl_compositor::Request::CreateSurface { id } => {
                let app = state.app_for(client);
                let surface_id = state.compositor.create_surface(app);
                let surface = data_init.init(id, surface_id);
                state.resources.surfaces.insert(surface_id, surface);
            }
            wl_compositor::Request::CreateRegion { id } => {
                data_init.init(id, RegionData::default());
            }
            _ => {}
        }
    }
}

// ============================================================================
// wl_surface
// ============================================================================

impl Dispatch<wl_surface::WlSurface, SurfaceId> for ServerState {
    fn request(
        state: &mut Self,
        _client: &Client,
        resource: &wl_surface::WlSurface,
        request: wl_surface::Request,
        surface_id: &SurfaceId,
        _dhandle: &wayland_server::DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            wl_surface::Request::Attach { buffer, x, y } => {
                let buffer_id = buffer
                    .as_ref()
                    .and_then(|b| b.data::<BufferId>())
                    .copied();
                if let Some(surface) = state.compositor.surfaces.get_mut(*surface_id) {
                    surface.attach(buffer_id, x, y);
                }
            }
            wl_surface::Request::Damage {
                x,
                y,
                width,
                height,
            }
            | wl_surface::Request::DamageBuffer {
                x,
                y,
                width,
                height,
            } => {
                if let Some(surface) = state.compositor.surfaces.get_mut(*surface_id) {
                    surface.damage(x, y, width.max(0) as u32, height.max(0) as u32);
                }
            }
            wl_surface::Request::Frame { callback } => {
                let cb: wl_callback::WlCallback = data_init.init(callback, ());
                let cb_id = cb.id().protocol_id();
                if let Some(surface) = state.compositor.surfaces.get_mut(*surface_id) {
                    surface.frame(cb_id);
                    state.resources.callbacks.insert(cb_id, cb);
                }
            }
            wl_surface::Request::SetOpaqueRegion { region } => {
                let value = region.as_ref().and_then(region_contents);
                if let Some(surface) = state.compositor.surfaces.get_mut(*surface_id) {
                    surface.set_opaque_region(value);
                }
            }
            wl_surface::Request::SetInputRegion { region } => {
                let value = region.as_ref().and_then(region_contents);
                if let Some(surface) = state.compositor.surfaces.get_mut(*surface_id) {
                    surface.set_input_region(value);
                }
            }
            wl_surface::Request::Commit => {
                let was_mapped = state.compositor.scene.contains(*surface_id);
                match state.compositor.commit(*surface_id) {
                    Ok(MapState::Mapped) if !was_mapped => {
                        debug!("Surface {:?} mapped", surface_id);
                        state.focus_on_map(*surface_id);
                    }
                    Ok(_) => {}
                    Err(err) => post_commit_error(resource, *surface_id, err),
                }
            }
            wl_surface::Request::SetBufferTransform { transform } => {
                let raw = match transform {
                    wayland_server::WEnum::Value(v) => v as i32,
                    wayland_server::WEnum::Unknown(v) => v as i32,
                };
                if let Some(surface) = state.compositor.surfaces.get_mut(*surface_id) {
                    surface.set_transform(raw);
                }
            }
            wl_surface::Request::SetBufferScale { scale } => {
                if let Some(surface) = state.compositor.surfaces.get_mut(*surface_id) {
                    surface.set_scale(scale);
                }
            }
            wl_surface::Request::Offset { x, y } => {
                if let Some(surface) = state.compositor.surfaces.get_mut(*surface_id) {
                    surface.set_offset(x, y);
                }
            }
            wl_surface::Request::Destroy => {
                state.compositor.destroy_surface(*surface_id);
                state.resources.surfaces.remove(surface_id);
            }
            _ => {}
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: wayland_server::backend::ClientId,
        _resource: &wl_surface::WlSurface,
        data: &SurfaceId,
    ) {
        state.compositor.destroy_surface(*data);
        state.resources.surfaces.remove(data);
        state.resources.xdg_surfaces.remove(data);
        state.resources.popups.remove(data);
    }
}

/// Snapshot a wl_region's accumulated contents
fn region_contents(region: &wl_region::WlRegion) -> Option<Region> {
    region
        .data::<RegionData>()
        .map(|d| d.contents.lock().unwrap().clone())
}

fn post_commit_error(resource: &wl_surface::WlSurface, surface: SurfaceId, err: CommitError) {
    warn!("Surface {:?}: commit rejected: {}", surface, err);
    let code = match err {
        // The popup's anchor is gone; the role object is defunct
        CommitError::ParentNotMapped => wl_surface::Error::DefunctRoleObject,
        _ => wl_surface::Error::InvalidSize,
    };
    resource.post_error(code, err.to_string());
}

// ============================================================================
// wl_region
// ============================================================================

/// Accumulated region contents; wayland user data is shared, so the interior
/// is locked
#[derive(Debug, Default)]
pub struct RegionData {
    contents: Mutex<Region>,
}

impl Dispatch<wl_region::WlRegion, RegionData> for ServerState {
    fn request(
        _state: &mut Self,
        _client: &Client,
        _resource: &wl_region::WlRegion,
        request: wl_region::Request,
        data: &RegionData,
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            wl_region::Request::Add {
                x,
                y,
                width,
                height,
            } => {
                data.contents
                    .lock()
                    .unwrap()
                    .add(x, y, width.max(0) as u32, height.max(0) as u32);
            }
            wl_region::Request::Subtract {
                x,
                y,
                width,
                height,
            } => {
                data.contents
                    .lock()
                    .unwrap()
                    .subtract(x, y, width.max(0) as u32, height.max(0) as u32);
            }
            wl_region::Request::Destroy => {}
            _ => {}
        }
    }
}

// ============================================================================
// wl_callback
// ============================================================================

impl Dispatch<wl_callback::WlCallback, ()> for ServerState {
    fn request(
        _state: &mut Self,
        _client: &Client,
        _resource: &wl_callback::WlCallback,
        _request: wl_callback::Request,
        _data: &(),
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        // wl_callback has no requests
    }
}

// ============================================================================
// wl_shm
// ============================================================================

impl Dispatch<wl_shm::WlShm, ()> for ServerState {
    fn request(
        state: &mut Self,
        _client: &Client,
        _resource: &wl_shm::WlShm,
        request: wl_shm::Request,
        _data: &(),
        _dhandle: &wayland_server::DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        if let wl_shm::Request::CreatePool { id, fd, size } = request {
            let pool_id = state.shm.create_pool(fd, size.max(0) as usize);
            data_init.init(id, pool_id);
        }
    }
}

// ============================================================================
// wl_shm_pool
// ============================================================================

impl Dispatch<wl_shm_pool::WlShmPool, ShmPoolId> for ServerState {
    fn request(
        state: &mut Self,
        _client: &Client,
        resource: &wl_shm_pool::WlShmPool,
        request: wl_shm_pool::Request,
        pool_id: &ShmPoolId,
        _dhandle: &wayland_server::DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            wl_shm_pool::Request::CreateBuffer {
                id,
                offset,
                width,
                height,
                stride,
                format,
            } => {
                match state.shm.create_buffer(
                    &mut state.compositor.buffers,
                    *pool_id,
                    offset.max(0) as u32,
                    width.max(0) as u32,
                    height.max(0) as u32,
                    stride.max(0) as u32,
                    format.into(),
                ) {
                    Ok(buffer_id) => {
                        let buffer = data_init.init(id, buffer_id);
                        state.resources.buffers.insert(buffer_id, buffer);
                    }
                    Err(err) => {
                        warn!("Pool {:?}: buffer rejected: {}", pool_id, err);
                        let code = match err {
                            ShmError::InvalidPool | ShmError::MapFailed => wl_shm::Error::InvalidFd,
                            ShmError::BufferTooLarge | ShmError::InvalidStride => {
                                wl_shm::Error::InvalidStride
                            }
                        };
                        resource.post_error(code, err.to_string());
                    }
                }
            }
            wl_shm_pool::Request::Resize { size } => {
                let _ = state.shm.resize_pool(*pool_id, size.max(0) as usize);
            }
            wl_shm_pool::Request::Destroy => {
                state.shm.destroy_pool(*pool_id);
            }
            _ => {}
        }
    }
}

// ============================================================================
// wl_buffer
// ============================================================================

impl Dispatch<wl_buffer::WlBuffer, BufferId> for ServerState {
    fn request(
        state: &mut Self,
        _client: &Client,
        _resource: &wl_buffer::WlBuffer,
        request: wl_buffer::Request,
        buffer_id: &BufferId,
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        if let wl_buffer::Request::Destroy = request {
            state.compositor.buffers.destroy(*buffer_id);
            state.resources.buffers.remove(buffer_id);
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: wayland_server::backend::ClientId,
        _resource: &wl_buffer::WlBuffer,
        data: &BufferId,
    ) {
        state.compositor.buffers.destroy(*data);
        state.resources.buffers.remove(data);
    }
}

// ============================================================================
// wl_seat
// ============================================================================

/// Seat user data
pub struct SeatData {
    pub capabilities: wl_seat::Capability,
}

impl Dispatch<wl_seat::WlSeat, SeatData> for ServerState {
    fn request(
        state: &mut Self,
        client: &Client,
        _resource: &wl_seat::WlSeat,
        request: wl_seat::Request,
        _data: &SeatData,
        _dhandle: &wayland_server::DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            wl_seat::Request::GetKeyboard { id } => {
                let keyboard = data_init.init(id, ());
                send_keymap(state, &keyboard);
                if keyboard.version() >= 4 {
                    let (rate, delay) = state
                        .compositor
                        .seat
                        .keyboards()
                        .first()
                        .map(|k| k.repeat_info())
                        .unwrap_or((25, 600));
                    keyboard.repeat_info(rate as i32, delay as i32);
                }
                if let Some(app) = state.app_for(client) {
                    state
                        .resources
                        .keyboards
                        .entry(app)
                        .or_default()
                        .push(keyboard);
                }
            }
            wl_seat::Request::GetPointer { id } => {
                let pointer = data_init.init(id, ());
                if let Some(app) = state.app_for(client) {
                    state
                        .resources
                        .pointers
                        .entry(app)
                        .or_default()
                        .push(pointer);
                }
            }
            wl_seat::Request::GetTouch { id } => {
                // Touch is advertised as absent; still serve the object
                data_init.init(id, ());
            }
            wl_seat::Request::Release => {}
            _ => {}
        }
    }
}

/// Send the seat keymap through a memfd
fn send_keymap(state: &ServerState, keyboard: &wl_keyboard::WlKeyboard) {
    match state.compositor.seat.keymap_string() {
        Some(text) => match keymap_fd(&text) {
            Ok((fd, size)) => {
                use std::os::unix::io::AsFd;
                keyboard.keymap(wl_keyboard::KeymapFormat::XkbV1, fd.as_fd(), size);
            }
            Err(e) => warn!("Failed to send keymap: {}", e),
        },
        None => {
            if let Ok((fd, _)) = keymap_fd("") {
                use std::os::unix::io::AsFd;
                keyboard.keymap(wl_keyboard::KeymapFormat::NoKeymap, fd.as_fd(), 0);
            }
        }
    }
}

// ============================================================================
// wl_pointer
// ============================================================================

impl Dispatch<wl_pointer::WlPointer, ()> for ServerState {
    fn request(
        state: &mut Self,
        client: &Client,
        resource: &wl_pointer::WlPointer,
        request: wl_pointer::Request,
        _data: &(),
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            wl_pointer::Request::SetCursor {
                serial: _,
                surface,
                hotspot_x,
                hotspot_y,
            } => {
                let Some(app) = state.app_for(client) else {
                    return;
                };
                let cursor = surface.as_ref().and_then(|s| s.data::<SurfaceId>()).copied();
                if let Err(err) = state.compositor.set_cursor(app, cursor, hotspot_x, hotspot_y)
                {
                    warn!("App {:?}: set_cursor rejected: {}", app, err);
                    resource.post_error(wl_pointer::Error::Role, err.to_string());
                }
            }
            wl_pointer::Request::Release => {
                let my_id = resource.id();
                for pointers in state.resources.pointers.values_mut() {
                    pointers.retain(|p| p.id() != my_id);
                }
            }
            _ => {}
        }
    }
}

// ============================================================================
// wl_keyboard
// ============================================================================

impl Dispatch<wl_keyboard::WlKeyboard, ()> for ServerState {
    fn request(
        state: &mut Self,
        _client: &Client,
        resource: &wl_keyboard::WlKeyboard,
        request: wl_keyboard::Request,
        _data: &(),
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        if let wl_keyboard::Request::Release = request {
            let my_id = resource.id();
            for keyboards in state.resources.keyboards.values_mut() {
                keyboards.retain(|k| k.id() != my_id);
            }
        }
    }
}

// ============================================================================
// wl_touch
// ============================================================================

impl Dispatch<wl_touch::WlTouch, ()> for ServerState {
    fn request(
        _state: &mut Self,
        _client: &Client,
        _resource: &wl_touch::WlTouch,
        _request: wl_touch::Request,
        _data: &(),
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        // Touch is not routed anywhere
    }
}

// ============================================================================
// wl_output
// ============================================================================

/// Output user data
pub struct OutputData {
    pub output_id: crate::compositor::output::OutputId,
}

impl Dispatch<wl_output::WlOutput, OutputData> for ServerState {
    fn request(
        _state: &mut Self,
        _client: &Client,
        _resource: &wl_output::WlOutput,
        request: wl_output::Request,
        data: &OutputData,
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        if let wl_output::Request::Release = request {
            debug!("Output {:?} released by client", data.output_id);
        }
    }
}
