#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(name) = std::str::from_utf8(data) else {
        return;
    };
    if sonar_core::ensure_relative_artifact(name).is_ok() {
        // Accepted names must never carry traversal or absolute segments.
        assert!(!name.split(['/', '\\']).any(|segment| segment == ".."));
        assert!(!name.starts_with('/'));
    }
});
