//! Event loop integration
//!
//! Thin wrapper over calloop. One dispatcher thread services socket I/O,
//! client fds, and the frame timer; every suspension point is the loop's
//! poll call.

use std::time::Duration;

use calloop::{EventLoop as CalLoop, LoopHandle, LoopSignal};

/// Compositor event loop wrapper
pub struct EventLoop<D: 'static> {
    event_loop: CalLoop<'static, D>,
    signal: LoopSignal,
}

impl<D> EventLoop<D> {
    /// Create a new event loop
    pub fn new() -> anyhow::Result<Self> {
        let event_loop = CalLoop::try_new()?;
        let signal = event_loop.get_signal();
        Ok(Self { event_loop, signal })
    }

    /// Get a handle to register event sources
    pub fn handle(&self) -> LoopHandle<'static, D> {
        self.event_loop.handle()
    }

    /// Get the loop signal for waking/stopping
    pub fn signal(&self) -> LoopSignal {
        self.signal.clone()
    }

    /// Run one iteration; blocks until a source fires or the timeout expires
    pub fn dispatch(&mut self, timeout: Option<Duration>, data: &mut D) -> anyhow::Result<()> {
        self.event_loop.dispatch(timeout, data)?;
        Ok(())
    }

    /// Stop the event loop
    pub fn stop(&self) {
        self.signal.stop();
    }

    /// Wake the event loop
    pub fn wake(&self) {
        self.signal.wakeup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_loop_new() {
        let event_loop: anyhow::Result<EventLoop<()>> = EventLoop::new();
        assert!(event_loop.is_ok());
    }

    #[test]
    fn test_event_loop_dispatch() {
        let mut event_loop: EventLoop<()> = EventLoop::new().unwrap();
        let result = event_loop.dispatch(Some(Duration::ZERO), &mut ());
        assert!(result.is_ok());
    }
}
