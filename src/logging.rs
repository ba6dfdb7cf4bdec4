//! Log setup for the `slpd` binary and tests.
//!
//! Library code only uses the `log` macros; installing a logger is left to
//! the process. Lines look like `[INFO ] [slp_engine::agent] message`.

use env_logger::{Builder, Env};
use std::io::Write;

pub const DEFAULT_FILTER: &str = "info";

/// Installs the logger with `RUST_LOG`, falling back to `info`.
/// Safe to call more than once.
pub fn init() {
    init_with(DEFAULT_FILTER);
}

pub fn init_with(default_filter: &str) {
    let _ = builder(default_filter).try_init();
}

/// Logger for unit tests: captured by the test harness, debug level.
pub fn init_for_tests() {
    let _ = builder("debug").is_test(true).try_init();
}

fn builder(default_filter: &str) -> Builder {
    let mut builder = Builder::from_env(Env::default().default_filter_or(default_filter));
    builder.format(|buf, record| {
        writeln!(buf, "[{:<5}] [{}] {}", record.level(), record.target(), record.args())
    });
    builder
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice() {
        init_for_tests();
        init_with("warn");
        log::info!("logger installed");
    }
}
