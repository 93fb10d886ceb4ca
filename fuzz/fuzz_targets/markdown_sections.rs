#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(markdown) = std::str::from_utf8(data) else {
        return;
    };
    // Section splitting must never panic and must only report headings
    // that actually occur in the document.
    let sections = sonar_wave::split_sections(markdown);
    for name in sections.keys() {
        assert!(markdown.contains(name.as_str()));
    }
});
