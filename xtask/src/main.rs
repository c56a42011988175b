//! Build automation tasks for the wifi-onboard project.
//!
//! Run with: `cargo xtask <command>`

use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use std::process::{Command, ExitCode};

/// Only the Pico 1 W carries the CYW43 radio this crate drives.
const TARGET: &str = "thumbv6m-none-eabi";
const FEATURES_NO_WIFI: &str = "pico1,arm";
const FEATURES_WIFI: &str = "pico1,arm,wifi,defmt";
const DEMOS: [&str; 1] = ["onboarding"];

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Build automation for wifi-onboard", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run all checks: host tests, firmware library and demos, docs
    CheckAll,
    /// Run the host-side protocol and state-machine tests
    Test,
    /// Build the library for the Pico 1 W
    Build {
        #[arg(long)]
        wifi: bool,
    },
    /// Build a demo firmware
    Demo {
        /// Demo name (e.g., onboarding)
        name: String,
    },
    /// Build UF2 firmware file for flashing to Pico
    Uf2 {
        /// Demo name (e.g., onboarding)
        name: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::CheckAll => check_all(),
        Commands::Test => exit_code(run_host_tests()),
        Commands::Build { wifi } => build_lib(wifi),
        Commands::Demo { name } => exit_code(build_demo(&name, false)),
        Commands::Uf2 { name } => build_uf2(&name),
    }
}

fn check_all() -> ExitCode {
    let workspace_root = workspace_root();

    println!("{}", "==> Running host tests...".cyan());
    if !run_host_tests() {
        return ExitCode::FAILURE;
    }

    for (label, features) in [("no wifi", FEATURES_NO_WIFI), ("wifi", FEATURES_WIFI)] {
        println!("\n{}", format!("==> Building library ({label})...").cyan());
        if !run_command(Command::new("cargo").current_dir(&workspace_root).args([
            "build",
            "--lib",
            "--target",
            TARGET,
            "--features",
            features,
            "--no-default-features",
        ])) {
            return ExitCode::FAILURE;
        }
    }

    println!("\n{}", "==> Building demos...".cyan());
    for demo in &DEMOS {
        println!("  {}", format!("- {demo}").bright_black());
        if !build_demo(demo, false) {
            return ExitCode::FAILURE;
        }
    }

    println!("\n{}", "==> Building documentation...".cyan());
    if !run_command(Command::new("cargo").current_dir(&workspace_root).args([
        "doc",
        "--target",
        TARGET,
        "--no-deps",
        "--features",
        FEATURES_WIFI,
        "--no-default-features",
    ])) {
        return ExitCode::FAILURE;
    }

    println!("\n{}", "==> All checks passed!".green().bold());
    ExitCode::SUCCESS
}

fn run_host_tests() -> bool {
    let mut test_cmd = Command::new("cargo");
    test_cmd
        .current_dir(workspace_root())
        .args(["test", "--no-default-features"]);

    match host_target() {
        Some(target) => {
            println!(
                "  {}",
                format!("Using host target: {target}").bright_black()
            );
            test_cmd.arg("--target").arg(target);
        }
        None => {
            println!(
                "{}",
                "  Unable to detect host target; relying on cargo default.".bright_black()
            );
        }
    }

    run_command(&mut test_cmd)
}

fn build_lib(wifi: bool) -> ExitCode {
    let features = if wifi { FEATURES_WIFI } else { FEATURES_NO_WIFI };
    println!(
        "{}",
        format!("Building library with features: {features}").cyan()
    );

    if run_command(Command::new("cargo").current_dir(workspace_root()).args([
        "build",
        "--lib",
        "--target",
        TARGET,
        "--features",
        features,
        "--no-default-features",
    ])) {
        println!("{}", "Build successful!".green());
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn build_demo(name: &str, release: bool) -> bool {
    println!(
        "{}",
        format!("Building demo '{name}' with features: {FEATURES_WIFI}").cyan()
    );

    let mut cmd = Command::new("cargo");
    cmd.current_dir(workspace_root()).args([
        "build",
        "--example",
        name,
        "--target",
        TARGET,
        "--features",
        FEATURES_WIFI,
        "--no-default-features",
    ]);
    if release {
        cmd.arg("--release");
    }

    run_command(&mut cmd)
}

fn build_uf2(name: &str) -> ExitCode {
    let workspace_root = workspace_root();
    println!("  Target: {}", TARGET.bright_black());

    // Build in release mode for UF2
    if !build_demo(name, true) {
        return ExitCode::FAILURE;
    }

    let elf_path = format!("target/{TARGET}/release/examples/{name}");
    let uf2_path = format!("{name}.uf2");

    println!("\n{}", "Converting to UF2 format...".cyan());

    if run_command(
        Command::new("elf2uf2-rs")
            .current_dir(&workspace_root)
            .args([&elf_path, &uf2_path]),
    ) {
        println!("{}", format!("UF2 created: {uf2_path}").green().bold());
        println!("{}", "Ready to drag-and-drop to your Pico W!".bright_black());
        ExitCode::SUCCESS
    } else {
        println!(
            "{}",
            "Note: Install elf2uf2-rs with: cargo install elf2uf2-rs".yellow()
        );
        ExitCode::FAILURE
    }
}

fn exit_code(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn workspace_root() -> std::path::PathBuf {
    // `cargo xtask` runs from the workspace root
    std::env::current_dir().expect("Failed to get current directory")
}

fn host_target() -> Option<String> {
    let output = Command::new("rustc").arg("-vV").output().ok()?;
    if !output.status.success() {
        return None;
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    for line in stdout.lines() {
        if let Some(host) = line.strip_prefix("host: ") {
            return Some(host.trim().to_string());
        }
    }
    None
}

fn run_command(cmd: &mut Command) -> bool {
    match cmd.status() {
        Ok(status) => status.success(),
        Err(e) => {
            eprintln!("{}", format!("Failed to execute command: {e}").red());
            false
        }
    }
}
