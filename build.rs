use std::process::Command;

fn run_or_unknown(program: &str, args: &[&str]) -> String {
    Command::new(program)
        .args(args)
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

fn main() {
    // CI may inject both values; fall back to git and date otherwise
    let commit = std::env::var("BUILD_COMMIT")
        .unwrap_or_else(|_| run_or_unknown("git", &["rev-parse", "--short", "HEAD"]));
    let date = std::env::var("BUILD_DATE").unwrap_or_else(|_| run_or_unknown("date", &["+%Y-%m-%d"]));

    println!("cargo:rustc-env=BUILD_COMMIT={}", commit);
    println!("cargo:rustc-env=BUILD_DATE={}", date);

    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-env-changed=BUILD_COMMIT");
    println!("cargo:rerun-if-env-changed=BUILD_DATE");
}
