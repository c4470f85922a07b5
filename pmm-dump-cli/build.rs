use std::process::Command;

fn main() {
    emit("GIT_COMMIT", &["rev-parse", "--short", "HEAD"]);
    emit("GIT_BRANCH", &["rev-parse", "--abbrev-ref", "HEAD"]);
    emit("GIT_VERSION", &["describe", "--tags", "--always", "--dirty"]);
    println!("cargo:rerun-if-changed=../.git/HEAD");
}

fn emit(var: &str, args: &[&str]) {
    let value = Command::new("git")
        .args(args)
        .output()
        .ok()
        .filter(|out| out.status.success())
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| format!("unknown-{}", env!("CARGO_PKG_VERSION")));
    println!("cargo:rustc-env={var}={value}");
}
