use std::process::Command;

fn git_short_hash() -> Option<String> {
    let rev = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|o| o.status.success())?;
    let mut hash = String::from_utf8_lossy(&rev.stdout).trim().to_string();

    let clean = Command::new("git")
        .args(["diff", "--quiet"])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(true);
    if !clean {
        hash.push_str("-dirty");
    }
    Some(hash)
}

fn main() {
    let hash = git_short_hash().unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env=GIT_HASH={hash}");
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs/heads");
}
