//! Fuzz target: the agent response envelope decoder.
//!
//! The guest is untrusted; whatever it answers on `/run` must never panic
//! the worker, including the partial-decode fallback over raw JSON values.

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = serde_json::from_slice::<kiln_core::AgentRunResponse>(data);

    // The salvage path walks the body again as an untyped value.
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(data) {
        let _ = value
            .get("clientResponse")
            .cloned()
            .map(serde_json::from_value::<kiln_core::JobResponse>);
    }
});
