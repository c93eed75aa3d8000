//! Fuzz target for notification parsing.

#![no_main]

use hub_replication::replication::remote::{parse_notification, ws_url_for};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (&str, u64)| {
    let (text, sequence) = data;

    let _ = parse_notification(text);
    assert!(ws_url_for(text).ends_with("/ws"));

    // A channel URL followed by a sequence always yields that sequence
    if !text.contains(char::is_whitespace) {
        let message = format!("{}/{}", text, sequence);
        assert_eq!(parse_notification(&message), Some(sequence));
    }
});
