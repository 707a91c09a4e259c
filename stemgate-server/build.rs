//! Build script for stemgate-server
//!
//! Stamps the binary with its source revision, build time, profile and target
//! triple (`GIT_HASH`, `BUILD_TIMESTAMP`, `BUILD_PROFILE`, `BUILD_TARGET`).
//! Builds outside a git checkout report `unknown` for the revision.

use std::env;
use std::process::Command;

/// Trimmed stdout of a successful git invocation
fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8(output.stdout).ok()?;
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_owned())
}

fn main() {
    // Short hash with a `-modified` suffix when the tree has local edits
    let revision = git(&["describe", "--always", "--abbrev=8", "--dirty=-modified"])
        .unwrap_or_else(|| "unknown".to_owned());

    let stamps = [
        ("GIT_HASH", revision),
        (
            "BUILD_TIMESTAMP",
            chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        ),
        (
            "BUILD_PROFILE",
            env::var("PROFILE").unwrap_or_else(|_| "unknown".to_owned()),
        ),
        (
            "BUILD_TARGET",
            env::var("TARGET").unwrap_or_else(|_| "unknown".to_owned()),
        ),
    ];
    for (key, value) in stamps {
        println!("cargo:rustc-env={key}={value}");
    }
}
