//! Feature-gated logging.
//!
//! With `--features tracing` the macros below are the `tracing` crate's.
//! Without it they expand to nothing, which keeps the TX/RX loops free of
//! formatting work. Because the no-op forms expand to nothing, call them in
//! statement position only.

/// Installs a `fmt` subscriber for the link threads.
///
/// The filter comes from `RUST_LOG` and defaults to `epixlink=debug`.
/// Later calls keep the first subscriber, so every test may call this.
/// Without the `tracing` feature this does nothing.
#[cfg(feature = "tracing")]
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("epixlink=debug"));
    let layer = fmt::layer()
        .with_thread_names(true)
        .with_target(false)
        .with_timer(fmt::time::uptime());

    let _ = tracing_subscriber::registry().with(filter).with(layer).try_init();
}

#[cfg(not(feature = "tracing"))]
pub const fn init_tracing() {}

#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, error, info, trace, warn};

#[cfg(not(feature = "tracing"))]
mod disabled {
    macro_rules! discard {
        ($($arg:tt)*) => {};
    }

    pub(crate) use discard as debug;
    pub(crate) use discard as error;
    pub(crate) use discard as info;
    pub(crate) use discard as trace;
    pub(crate) use discard as warn;
}

#[cfg(not(feature = "tracing"))]
pub(crate) use disabled::{debug, error, info, trace, warn};
