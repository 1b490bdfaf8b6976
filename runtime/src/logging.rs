//! Logging setup for hosts embedding the runtime
//!
//! The runtime itself only emits through the `log` facade:
//!
//! - `error!` - resolution failures and safety violations
//! - `info!` - loaded and resolved modules
//! - `debug!` - class registration, method declaration, slot binding
//!
//! A host that has no logger of its own can install `env_logger` with one of
//! the functions below. `RUST_LOG` narrows it per module, e.g.
//! `RUST_LOG=jnishim_runtime::resolve=debug`.

use env_logger::{Builder, Env};
use log::LevelFilter;
use std::io::Write;
use std::sync::Once;

static INIT: Once = Once::new();

/// Records are tagged with the emitting runtime module, e.g.
/// `[ERROR resolve] module 'libdemo.so': unresolved import ...`
fn install(mut builder: Builder) {
    INIT.call_once(|| {
        builder
            .format(|buf, record| {
                let target = record.target();
                let module = target.strip_prefix("jnishim_runtime::").unwrap_or(target);
                writeln!(buf, "[{:5} {}] {}", record.level(), module, record.args())
            })
            .init();
    });
}

/// Install a logger at a fixed level, ignoring `RUST_LOG`. Later calls are
/// no-ops.
pub fn init_with_level(level: LevelFilter) {
    let mut builder = Builder::new();
    builder.filter_level(level);
    install(builder);
}

/// Install a logger configured by `RUST_LOG`, defaulting to `warn`.
pub fn init_from_env() {
    install(Builder::from_env(Env::default().default_filter_or("warn")));
}

/// Logger for tests; safe to call from every test.
pub fn init_test() {
    let _ = env_logger::builder()
        .filter_level(LevelFilter::Warn)
        .is_test(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_test_is_idempotent() {
        init_test();
        init_test();
        log::debug!("logging initialised for tests");
    }
}
