//! Shutdown on signals.
//!
//! The first SIGINT, SIGTERM or SIGHUP cancels the run's token: in-flight
//! store calls and backoff sleeps return promptly and the cursor stays at
//! the last fully applied version. A second signal exits immediately with
//! 128 + signal number.

use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::thread;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

fn signal_name(sig: i32) -> &'static str {
    match sig {
        SIGINT => "SIGINT",
        SIGTERM => "SIGTERM",
        SIGHUP => "SIGHUP",
        _ => "UNKNOWN",
    }
}

/// Install the signal listener thread. Call once at program start.
pub fn cancel_on_signals(cancel: CancellationToken) -> Result<(), std::io::Error> {
    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;

    thread::Builder::new()
        .name("signal-listener".to_string())
        .spawn(move || {
            for sig in signals.forever() {
                if cancel.is_cancelled() {
                    warn!("Received {} again, exiting immediately", signal_name(sig));
                    std::process::exit(128 + sig);
                }
                info!(
                    "Received {} signal, cancelling in-flight migrations...",
                    signal_name(sig)
                );
                cancel.cancel();
            }
        })?;

    Ok(())
}
