//! Button input on a host without GPIO: `SIGUSR1` is a short press,
//! `SIGUSR2` a long press.

use node_core::events::{Event, EventBus};
use std::io;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;

pub fn spawn_signal_buttons(bus: Arc<EventBus>) -> io::Result<JoinHandle<()>> {
    let mut short = signal(SignalKind::user_defined1())?;
    let mut long = signal(SignalKind::user_defined2())?;
    tracing::info!("Button input: SIGUSR1 = short press, SIGUSR2 = long press");

    Ok(tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                Some(()) = short.recv() => Event::ButtonShortPress,
                Some(()) = long.recv() => Event::ButtonLongPress,
                else => break,
            };
            tracing::debug!(?event, "Button pressed");
            bus.publish(event);
        }
    }))
}
