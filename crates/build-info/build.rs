use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::Utc;

fn main() {
    println!("cargo:rerun-if-env-changed=TOKENVAULT_BUILD_ID_OVERRIDE");

    if let Some(git_dir) = find_git_dir() {
        for path in head_paths(&git_dir) {
            println!("cargo:rerun-if-changed={}", path.display());
        }
    }

    let override_id = env::var("TOKENVAULT_BUILD_ID_OVERRIDE").ok();
    let build_time = Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();
    let git_label = git_describe().unwrap_or_else(|| "unknown".to_string());

    let build_id = override_id.unwrap_or_else(|| format!("{} | {}", build_time, git_label));

    println!("cargo:rustc-env=TOKENVAULT_BUILD_ID={}", build_id);
    println!("cargo:rustc-env=TOKENVAULT_BUILD_TIME={}", build_time);
    println!("cargo:rustc-env=TOKENVAULT_BUILD_GIT={}", git_label);
}

/// Walks up from the crate directory, the crate lives two levels below the
/// workspace root where `.git` sits.
fn find_git_dir() -> Option<PathBuf> {
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").ok()?;
    let mut current = Some(Path::new(&manifest_dir));
    while let Some(dir) = current {
        let candidate = dir.join(".git");
        if candidate.is_dir() {
            return Some(candidate);
        }
        current = dir.parent();
    }
    None
}

fn head_paths(git_dir: &Path) -> Vec<PathBuf> {
    let head_path = git_dir.join("HEAD");
    let mut paths = vec![head_path.clone()];

    if let Ok(head_ref) = fs::read_to_string(&head_path) {
        if let Some(reference) = head_ref.strip_prefix("ref: ") {
            let ref_path = git_dir.join(reference.trim());
            if ref_path.exists() {
                paths.push(ref_path);
            }
        }
    }

    paths
}

fn git_describe() -> Option<String> {
    let output = Command::new("git")
        .args(["describe", "--tags", "--dirty", "--always"])
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let raw = String::from_utf8_lossy(&output.stdout);
    let label = raw.trim();
    if label.is_empty() {
        None
    } else {
        Some(label.to_string())
    }
}
