//! Fuzz target for exit-policy parsing and evaluation.
//!
//! Run with: cargo +nightly fuzz run fuzz_exit_policy
//!
//! The first three bytes pick the port and a split point; the rest is rule
//! text (one rule per line) followed by the address to check.

#![no_main]

use libfuzzer_sys::fuzz_target;
use relayctl_config::ExitPolicy;

fuzz_target!(|data: &[u8]| {
    if data.len() < 4 {
        return;
    }

    let port = u16::from_be_bytes([data[0], data[1]]);
    let rest = &data[3..];
    let split = data[2] as usize % rest.len();

    let Ok(rules) = std::str::from_utf8(&rest[..split]) else {
        return;
    };
    let address = std::str::from_utf8(&rest[split..]).unwrap_or("127.0.0.1");

    let entries: Vec<&str> = rules.lines().collect();
    if let Ok(Some(policy)) = ExitPolicy::from_entries(&entries) {
        let _ = policy.check(address, port);
        let _ = policy.to_string();
    }
});
