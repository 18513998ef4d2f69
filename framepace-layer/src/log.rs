//! Tracing bootstrap for the injected process.
//!
//! The host application does not know the layer exists and installs no
//! subscriber, so the layer brings its own. [`init`] is called from
//! every loader-facing entry point and is a no-op after the first call.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

/// Log target used by every record the layer emits.
pub const TARGET: &str = "framepace";

static INIT: Once = Once::new();

/// Install the layer's fmt subscriber once per process.
///
/// Verbosity comes from `FRAMEPACE_LOG` (an `EnvFilter` directive,
/// default `info`). Installation failure is ignored: if the host has a
/// subscriber of its own, the layer's records flow into it instead.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env("FRAMEPACE_LOG")
            .unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .try_init();
    });
}
