//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code MUST NOT call sleep methods. Sequence timing
//! comes from the virtual clock, which is advanced by `tokio::time::interval`
//! ticks with measured deltas; a sleep would drift it.
//! **Exceptions**: test code

use architectural_enforcement::{production_dirs, violations};

#[test]
fn test_no_sleep_in_production_code() {
    let found = violations(&production_dirs(), |code| {
        code.contains("::sleep(") || code.contains(".sleep(")
    });

    if !found.is_empty() {
        eprintln!("\nSleep calls found in production code:\n");
        for violation in &found {
            eprintln!("  {violation}");
        }
        eprintln!("\nUse tokio::time::interval for periodic work and channels to wait for events.");
        panic!("Found {} sleep violation(s) in production code", found.len());
    }
}

#[test]
fn test_no_blocking_thread_sleep_anywhere_in_core() {
    let found = violations(&production_dirs()[..1], |code| code.contains("thread::sleep"));
    assert!(found.is_empty(), "{found:#?}");
}
