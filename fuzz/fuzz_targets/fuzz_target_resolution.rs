#![no_main]

//! Fuzz target for target URL resolution.
//!
//! # Goal
//! Arbitrary caller input must never panic, and anything accepted must be
//! a well-formed http(s) URI that the guard would accept again.

use corsway::server::extract_target;
use corsway::target::{Scheme, TargetResolver};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(raw) = std::str::from_utf8(data) else {
        return;
    };

    for allow_private in [false, true] {
        let resolver = TargetResolver::new(allow_private);
        if let Ok(target) = resolver.resolve(raw) {
            let scheme = target.uri().scheme_str().unwrap_or_default();
            assert!(scheme == Scheme::Http.as_str() || scheme == Scheme::Https.as_str());
            assert!(!target.host().is_empty());

            // Resolution is idempotent on its own output.
            let again = resolver
                .resolve(&target.to_string())
                .expect("resolved target must resolve again");
            assert_eq!(again.uri(), target.uri());
        }
    }

    // Request-line extraction must tolerate anything hyper accepts as a URI.
    if let Ok(uri) = format!("/{raw}").parse::<http::Uri>() {
        let _ = extract_target(&uri);
    }
});
