//! Shared plumbing for the integration tests: tracing setup, port
//! allocation, fixture paths and bounded waiting.

#![allow(dead_code)]

use std::net::TcpListener;
use std::sync::Once;
use std::thread;
use std::time::{Duration, Instant};

static TRACING: Once = Once::new();

/// Install the test tracing subscriber once; `RUST_LOG` controls verbosity.
pub fn setup() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Grab a free loopback port from the kernel.
pub fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("binding an ephemeral port")
        .local_addr()
        .expect("reading the ephemeral port")
        .port()
}

/// Path of a PEM fixture under `tests/fixtures/`.
pub fn fixture(name: &str) -> String {
    format!("{}/tests/fixtures/{}", env!("CARGO_MANIFEST_DIR"), name)
}

/// Poll `pred` until it holds or `timeout` elapses; returns whether it held.
pub fn wait_until(timeout: Duration, pred: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    pred()
}

/// Like [`wait_until`] with the five-second default the suite uses.
pub fn eventually(pred: impl Fn() -> bool) -> bool {
    wait_until(Duration::from_secs(5), pred)
}
