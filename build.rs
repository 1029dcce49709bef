use std::env;
use std::process::Command;

fn main() {
    let build_time = chrono::Utc::now()
        .format("%Y-%m-%d %H:%M:%S UTC")
        .to_string();

    let vars = [
        ("BUILD_TIME", Some(build_time)),
        ("GIT_HASH", run("git", &["rev-parse", "--short", "HEAD"])),
        ("GIT_BRANCH", run("git", &["rev-parse", "--abbrev-ref", "HEAD"])),
        ("RUST_VERSION", run("rustc", &["--version"])),
        ("TARGET_ARCH", env::var("TARGET").ok()),
        ("BUILD_PROFILE", env::var("PROFILE").ok()),
    ];

    for (name, value) in vars {
        let value = value.unwrap_or_else(|| "unknown".to_string());
        println!("cargo:rustc-env={}={}", name, value);
    }

    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs/heads/");
}

/// 执行命令，返回去除空白后的标准输出
fn run(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
