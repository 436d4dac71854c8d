use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=SOURCE_DATE_EPOCH");

    #[cfg(not(target_os = "linux"))]
    compile_error!("sediag reads /proc and /sys and only builds on Linux");

    // 可复现构建：优先使用 SOURCE_DATE_EPOCH
    let mut date = Command::new("date");
    date.arg("-u");
    if let Ok(epoch) = std::env::var("SOURCE_DATE_EPOCH") {
        date.arg("-d").arg(format!("@{}", epoch));
    }
    date.arg("+%Y-%m-%d %H:%M:%S UTC");

    let build_time = date
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env=BUILD_TIME={}", build_time);
}
