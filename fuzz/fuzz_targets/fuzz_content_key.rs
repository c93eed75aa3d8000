//! Fuzz target for content key parsing.
//!
//! Parsing never panics on arbitrary input, and a parsed key renders to a
//! URL that parses back to the same key.

#![no_main]

use hub_replication::ContentKey;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    let Some(key) = ContentKey::from_url(data) else {
        return;
    };

    let again = ContentKey::from_url(&key.to_url());
    assert_eq!(again.as_ref(), Some(&key));
    assert!(key.millis() <= ContentKey::MAX_MILLIS);
    assert!(ContentKey::NONE <= key);
});
