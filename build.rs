//! Build script for OpenMind Peer
//!
//! Embeds build metadata (git revision, timestamp, target, profile and
//! compiler version) so `openmind-peer version` can report it.

use std::env;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");

    let git_hash = run_trimmed("git", &["rev-parse", "--short=8", "HEAD"]);
    let git_branch = run_trimmed("git", &["rev-parse", "--abbrev-ref", "HEAD"]);
    let git_dirty = match Command::new("git").args(["status", "--porcelain"]).output() {
        Ok(out) if out.status.success() => {
            if out.stdout.is_empty() { "false" } else { "true" }
        }
        _ => "unknown",
    };

    let vars = [
        ("OPENMIND_GIT_HASH", git_hash),
        ("OPENMIND_GIT_BRANCH", git_branch),
        ("OPENMIND_GIT_DIRTY", git_dirty.to_string()),
        (
            "OPENMIND_BUILD_TIMESTAMP",
            chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        ),
        ("OPENMIND_TARGET", env_or_unknown("TARGET")),
        ("OPENMIND_PROFILE", env_or_unknown("PROFILE")),
        ("OPENMIND_HOST", env_or_unknown("HOST")),
        ("OPENMIND_RUSTC_VERSION", run_trimmed("rustc", &["--version"])),
    ];

    for (key, value) in &vars {
        println!("cargo:rustc-env={}={}", key, value);
    }
}

fn env_or_unknown(key: &str) -> String {
    env::var(key).unwrap_or_else(|_| "unknown".to_string())
}

/// Run a command and return its trimmed stdout, or "unknown" on any failure
fn run_trimmed(program: &str, args: &[&str]) -> String {
    Command::new(program)
        .args(args)
        .output()
        .ok()
        .filter(|out| out.status.success())
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}
