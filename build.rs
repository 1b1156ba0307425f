use std::path::Path;
use std::process::Command;

/// 短縮コミットハッシュ。git が無い・リポジトリ外なら None。
fn git_revision() -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let rev = String::from_utf8(output.stdout).ok()?;
    let rev = rev.trim();
    (!rev.is_empty()).then(|| rev.to_string())
}

fn main() {
    if Path::new(".git/HEAD").exists() {
        println!("cargo:rerun-if-changed=.git/HEAD");
    }
    println!("cargo:rerun-if-changed=build.rs");

    let package = env!("CARGO_PKG_VERSION");
    let version = match git_revision() {
        Some(rev) => format!("{package}+{rev}"),
        None => package.to_string(),
    };
    println!("cargo:rustc-env=HOBO_VERSION={version}");
}
