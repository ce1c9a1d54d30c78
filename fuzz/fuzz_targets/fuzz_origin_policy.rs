#![no_main]

//! Fuzz target for origin pattern parsing and matching.
//!
//! Input is split on the first newline: pattern list, then Origin header.

use corsway::policy::{OriginPolicy, parse_patterns};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };
    let (patterns, origin) = input.split_once('\n').unwrap_or((input, ""));

    let Ok(patterns) = parse_patterns(patterns.split(',')) else {
        return;
    };

    // Every parsed pattern prints back to something that parses identically.
    for pattern in &patterns {
        let reparsed: corsway::policy::OriginPattern = pattern
            .to_string()
            .parse()
            .expect("displayed pattern must parse");
        assert_eq!(&reparsed, pattern);
    }

    let whitelist_is_empty = patterns.is_empty();
    let whitelist = OriginPolicy::new(patterns.clone(), Vec::new(), false);
    let blacklist = OriginPolicy::new(Vec::new(), patterns, false);
    let origin = Some(origin).filter(|o| !o.trim().is_empty());

    // A non-empty list admits an origin as whitelist exactly when it refuses
    // it as blacklist.
    if origin.is_some() && !whitelist_is_empty {
        assert_ne!(
            whitelist.check(origin).is_allow(),
            blacklist.check(origin).is_allow()
        );
    }
});
