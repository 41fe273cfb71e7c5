//! Minimal Wayland client for exercising the window server
//!
//! Connects, walks a toplevel through the configure/ack handshake, commits
//! a solid-color shm buffer, and waits for the buffer release.
//! Run with: cargo run --example simple_client

use std::os::unix::io::AsFd;

use wayland_client::{
    protocol::{wl_buffer, wl_compositor, wl_registry, wl_seat, wl_shm, wl_shm_pool, wl_surface},
    Connection, Dispatch, EventQueue, QueueHandle,
};
use wayland_protocols::xdg::shell::client::{xdg_surface, xdg_toplevel, xdg_wm_base};

fn main() -> anyhow::Result<()> {
    println!("Connecting to window server...");

    let conn = Connection::connect_to_env()?;
    let mut event_queue: EventQueue<AppState> = conn.new_event_queue();
    let qh = event_queue.handle();

    let display = conn.display();
    display.get_registry(&qh, ());

    let mut state = AppState {
        running: true,
        compositor: None,
        shm: None,
        seat: None,
        xdg_wm_base: None,
        surface: None,
        xdg_surface: None,
        xdg_toplevel: None,
        buffer: None,
        configured: false,
    };

    println!("Getting globals...");
    event_queue.roundtrip(&mut state)?;

    let Some(compositor) = &state.compositor else {
        anyhow::bail!("No wl_compositor available");
    };
    let surface = compositor.create_surface(&qh, ());
    state.surface = Some(surface);

    let Some(wm_base) = &state.xdg_wm_base else {
        anyhow::bail!("No xdg_wm_base available");
    };
    let xdg_surface = wm_base.get_xdg_surface(state.surface.as_ref().unwrap(), &qh, ());
    let xdg_toplevel = xdg_surface.get_toplevel(&qh, ());
    xdg_toplevel.set_title("Nacre Demo".to_string());
    xdg_toplevel.set_app_id("org.nacre.demo".to_string());
    state.xdg_surface = Some(xdg_surface);
    state.xdg_toplevel = Some(xdg_toplevel);

    // First commit starts the configure cycle
    state.surface.as_ref().unwrap().commit();

    println!("Waiting for configure...");
    while !state.configured {
        event_queue.blocking_dispatch(&mut state)?;
    }

    // Draw into a shared-memory buffer and commit it
    let Some(shm) = &state.shm else {
        anyhow::bail!("No wl_shm available");
    };
    let width = 640i32;
    let height = 480i32;
    let stride = width * 4;
    let size = stride * height;

    let file = tempfile::tempfile()?;
    file.set_len(size as u64)?;
    {
        use std::io::{Seek, SeekFrom, Write};
        let mut file = &file;
        file.seek(SeekFrom::Start(0))?;
        let row: Vec<u8> = (0..width)
            .flat_map(|_| [0x88u8, 0x66, 0x44, 0xFF])
            .collect();
        for _ in 0..height {
            file.write_all(&row)?;
        }
    }

    let pool = shm.create_pool(file.as_fd(), size, &qh, ());
    let buffer = pool.create_buffer(0, width, height, stride, wl_shm::Format::Argb8888, &qh, ());
    state.buffer = Some(buffer);

    let surface = state.surface.as_ref().unwrap();
    surface.attach(state.buffer.as_ref(), 0, 0);
    surface.damage_buffer(0, 0, width, height);
    surface.commit();

    println!("Window mapped; waiting for events (Ctrl+C to exit)");
    while state.running {
        event_queue.blocking_dispatch(&mut state)?;
    }

    Ok(())
}

struct AppState {
    running: bool,
    compositor: Option<wl_compositor::WlCompositor>,
    shm: Option<wl_shm::WlShm>,
    seat: Option<wl_seat::WlSeat>,
    xdg_wm_base: Option<xdg_wm_base::XdgWmBase>,
    surface: Option<wl_surface::WlSurface>,
    xdg_surface: Option<xdg_surface::XdgSurface>,
    xdg_toplevel: Option<xdg_toplevel::XdgToplevel>,
    buffer: Option<wl_buffer::WlBuffer>,
    configured: bool,
}

impl Dispatch<wl_registry::WlRegistry, ()> for AppState {
    fn event(
        state: &mut Self,
        registry: &wl_registry::WlRegistry,
        event: wl_registry::Event,
        _data: &(),
        _conn: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        if let wl_registry::Event::Global {
            name,
            interface,
            version,
        } = event
        {
            match interface.as_str() {
                "wl_compositor" => {
                    state.compositor = Some(registry.bind::<wl_compositor::WlCompositor, _, _>(
                        name,
                        version.min(6),
                        qh,
                        (),
                    ));
                }
                "wl_shm" => {
                    state.shm =
                        Some(registry.bind::<wl_shm::WlShm, _, _>(name, version.min(1), qh, ()));
                }
                "wl_seat" => {
                    state.seat =
                        Some(registry.bind::<wl_seat::WlSeat, _, _>(name, version.min(9), qh, ()));
                }
                "xdg_wm_base" => {
                    state.xdg_wm_base = Some(registry.bind::<xdg_wm_base::XdgWmBase, _, _>(
                        name,
                        version.min(6),
                        qh,
                        (),
                    ));
                }
                _ => {}
            }
        }
    }
}

impl Dispatch<wl_compositor::WlCompositor, ()> for AppState {
    fn event(
        _state: &mut Self,
        _proxy: &wl_compositor::WlCompositor,
        _event: wl_compositor::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<wl_surface::WlSurface, ()> for AppState {
    fn event(
        _state: &mut Self,
        _proxy: &wl_surface::WlSurface,
        _event: wl_surface::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<wl_shm::WlShm, ()> for AppState {
    fn event(
        _state: &mut Self,
        _proxy: &wl_shm::WlShm,
        event: wl_shm::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let wl_shm::Event::Format { format } = event {
            println!("  SHM format: {:?}", format);
        }
    }
}

impl Dispatch<wl_shm_pool::WlShmPool, ()> for AppState {
    fn event(
        _state: &mut Self,
        _proxy: &wl_shm_pool::WlShmPool,
        _event: wl_shm_pool::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<wl_buffer::WlBuffer, ()> for AppState {
    fn event(
        _state: &mut Self,
        _proxy: &wl_buffer::WlBuffer,
        event: wl_buffer::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let wl_buffer::Event::Release = event {
            println!("Buffer released; safe to reuse");
        }
    }
}

impl Dispatch<wl_seat::WlSeat, ()> for AppState {
    fn event(
        _state: &mut Self,
        _proxy: &wl_seat::WlSeat,
        event: wl_seat::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        match event {
            wl_seat::Event::Capabilities { capabilities } => {
                println!("  Seat capabilities: {:?}", capabilities);
            }
            wl_seat::Event::Name { name } => {
                println!("  Seat name: {}", name);
            }
            _ => {}
        }
    }
}

impl Dispatch<xdg_wm_base::XdgWmBase, ()> for AppState {
    fn event(
        _state: &mut Self,
        proxy: &xdg_wm_base::XdgWmBase,
        event: xdg_wm_base::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let xdg_wm_base::Event::Ping { serial } = event {
            proxy.pong(serial);
        }
    }
}

impl Dispatch<xdg_surface::XdgSurface, ()> for AppState {
    fn event(
        state: &mut Self,
        proxy: &xdg_surface::XdgSurface,
        event: xdg_surface::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let xdg_surface::Event::Configure { serial } = event {
            println!("Configured (serial {})", serial);
            proxy.ack_configure(serial);
            state.configured = true;
        }
    }
}

impl Dispatch<xdg_toplevel::XdgToplevel, ()> for AppState {
    fn event(
        state: &mut Self,
        _proxy: &xdg_toplevel::XdgToplevel,
        event: xdg_toplevel::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        match event {
            xdg_toplevel::Event::Configure {
                width,
                height,
                states,
            } => {
                println!("Toplevel configure: {}x{}, states: {:?}", width, height, states);
            }
            xdg_toplevel::Event::Close => {
                println!("Close requested");
                state.running = false;
            }
            _ => {}
        }
    }
}
