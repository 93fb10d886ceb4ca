#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(raw) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(normalized) = sonar_citations::normalize_url(raw) {
        // Normalization must be a fixpoint and never grow a fragment back.
        let again = sonar_citations::normalize_url(&normalized)
            .expect("normalized URLs must re-normalize");
        assert_eq!(normalized, again);
        assert!(!normalized.contains('#'));
        let _ = sonar_core::cid_for_url(&normalized);
    }
});
