//! Fuzz target: the janitor's residue matcher.
//!
//! Directory entry names are arbitrary; matching must never panic and must
//! never match names outside the configured prefixes.

#![no_main]

use libfuzzer_sys::fuzz_target;

use kiln_executor::{Janitor, VmmConfig};

fuzz_target!(|data: &[u8]| {
    let Ok(name) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(janitor) = Janitor::new(&VmmConfig::default()) else {
        return;
    };
    if janitor.is_residue(name) {
        assert!(
            name.starts_with("firecracker-") || name.starts_with("python_fs_image.ext4"),
            "matcher fired on a foreign name: {name:?}"
        );
    }
});
