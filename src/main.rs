//! Nacre - an event-driven window server core
//!
//! Entry point: builds the compositor context, binds the display socket,
//! and runs the event loop against the headless render backend.

use log::{error, info, warn};

use nacre::compositor::output::{Output, OutputMode};
use nacre::renderer::HeadlessBackend;
use nacre::server::{ServerState, WindowServer};

fn run() -> anyhow::Result<()> {
    let mut state = ServerState::new();

    // One headless output until a hardware backend attaches
    let mut output = Output::new("headless-1".into(), "Nacre".into(), "Virtual Display".into());
    output.add_mode(OutputMode {
        width: 1920,
        height: 1080,
        refresh: 60_000,
        preferred: true,
    });
    state.compositor.add_output(output);

    if !state.compositor.seat.load_keymap("us") {
        warn!("No XKB keymap available; keyboards run without one");
    }
    state.compositor.seat.attach_keyboard("virtual-keyboard".into());
    state.compositor.seat.attach_pointer();

    let mut server = WindowServer::new()?;
    server.register_globals();
    info!("Set WAYLAND_DISPLAY={} to connect", server.socket_name());

    server.run(state, Box::new(HeadlessBackend::new()))
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting nacre window server");

    // Infrastructure loss (socket, display, render backend) lands here:
    // logged, exit non-zero
    if let Err(e) = run() {
        error!("Window server exited: {:#}", e);
        std::process::exit(1);
    }
    Ok(())
}
