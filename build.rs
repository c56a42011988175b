use std::{env, fs, path::PathBuf};

fn main() {
    // 1) Handle memory.x based on target
    let target = env::var("TARGET").unwrap();
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());

    if target.starts_with("thumbv6m") {
        // Pico 1W: copy our custom memory-pico1w.x to OUT_DIR as memory.x
        let memory_x =
            fs::read_to_string("memory-pico1w.x").expect("Failed to read memory-pico1w.x");
        let dest = out_dir.join("memory.x");
        fs::write(&dest, memory_x).expect("Failed to write memory.x");
        println!("cargo:rustc-link-search={}", out_dir.display());
        println!("cargo:rerun-if-changed=memory-pico1w.x");
    }

    // 2) Load optional env files
    let _ = dotenvy::from_filename(".env");
    load_home_env(".pico.env");

    // 3) Fall back to the stock setup network and time server
    let ap_ssid = env_or_default("ONBOARD_AP_SSID", "alarm-clock-setup");
    let ntp_server = env_or_default("ONBOARD_NTP_SERVER", "pool.ntp.org");

    if ap_ssid.is_empty() || ap_ssid.len() > 32 {
        println!("cargo:warning=ONBOARD_AP_SSID must be 1..=32 bytes; got {} bytes", ap_ssid.len());
    }

    // 4) Expose as compile-time constants
    println!("cargo:rustc-env=ONBOARD_AP_SSID={ap_ssid}");
    println!("cargo:rustc-env=ONBOARD_NTP_SERVER={ntp_server}");

    println!("cargo:rerun-if-env-changed=ONBOARD_AP_SSID");
    println!("cargo:rerun-if-env-changed=ONBOARD_NTP_SERVER");
    println!("cargo:rerun-if-changed=.env");
}

fn load_home_env(file: &str) {
    let home = match env::var_os("USERPROFILE").or_else(|| env::var_os("HOME")) {
        Some(path) => PathBuf::from(path),
        None => return,
    };
    let path = home.join(file);
    let _ = dotenvy::from_path(&path);
}

fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
