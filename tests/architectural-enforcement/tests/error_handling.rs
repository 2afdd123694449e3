//! Integration Test: Errors Are Values
//!
//! **Policy**: nothing in the command path may abort the process. Production
//! code propagates errors with `?` or answers them with an `ERR` reply; it
//! never calls `unwrap()`, `expect()`, `panic!`, `todo!` or `unimplemented!`.
//! **Exceptions**: test code

use architectural_enforcement::{production_dirs, violations};

const FORBIDDEN: [&str; 5] = [".unwrap()", ".expect(", "panic!(", "todo!(", "unimplemented!("];

#[test]
fn test_no_panicking_calls_in_production_code() {
    let found = violations(&production_dirs(), |code| {
        FORBIDDEN.iter().any(|pattern| code.contains(pattern))
    });

    if !found.is_empty() {
        eprintln!("\nPanicking calls found in production code:\n");
        for violation in &found {
            eprintln!("  {violation}");
        }
        panic!("Found {} panicking call(s) in production code", found.len());
    }
}
