//! Integration Test: Transport-Free Core
//!
//! **Policy**: `sith-core` turns bytes into HAL calls and nothing else. Sockets,
//! serial devices, signals and process management live in `sith-daemon`.

use architectural_enforcement::{rust_files, violations, workspace_root};

const TRANSPORT_APIS: [&str; 6] = [
    "tokio::net",
    "tokio::signal",
    "tokio::process",
    "std::net",
    "std::process::exit",
    "nix::",
];

#[test]
fn test_core_has_no_transport_code() {
    let core = vec![workspace_root().join("sith/core/src")];
    let found = violations(&core, |code| {
        TRANSPORT_APIS.iter().any(|api| code.contains(api))
    });
    assert!(found.is_empty(), "transport code in sith-core:\n{found:#?}");
}

#[test]
fn test_core_does_not_depend_on_daemon_crates() {
    let manifest = std::fs::read_to_string(workspace_root().join("sith/core/Cargo.toml"))
        .expect("sith/core/Cargo.toml readable");
    for dep in ["clap", "nix", "dashmap", "tracing-subscriber", "anyhow"] {
        assert!(
            !manifest.lines().any(|l| l.trim_start().starts_with(&format!("{dep} ="))),
            "sith-core must not depend on {dep}"
        );
    }
}

#[test]
fn test_daemon_hosts_every_transport() {
    let daemon = workspace_root().join("sith/daemon/src");
    let names: Vec<String> = rust_files(&daemon)
        .iter()
        .filter_map(|p| p.file_stem().and_then(|s| s.to_str()).map(str::to_string))
        .collect();
    for module in ["server", "serial", "session"] {
        assert!(names.iter().any(|n| n == module), "daemon is missing {module}.rs");
    }
}
