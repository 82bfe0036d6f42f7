//! Fuzz target: JSON deserialization of `JobRequest`.
//!
//! Arbitrary byte sequences fed to the `/run-job` body parser must never
//! panic; errors are expected and fine.

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = serde_json::from_slice::<kiln_core::JobRequest>(data);
});
