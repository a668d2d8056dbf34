// =============================================================================
// raspvisor - ARM64 Build Script
// =============================================================================
// Assembles the boot code and links it with Rust. Only the bare-metal target
// gets the object; host builds (unit tests) skip it entirely.
// =============================================================================

use std::env;
use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-changed=src/boot.S");

    let arch = env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default();
    let os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    if arch != "aarch64" || os != "none" {
        return;
    }

    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let arch_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());

    cc::Build::new()
        .file(arch_dir.join("src/boot.S"))
        .flag("-c")
        .flag("-target")
        .flag("aarch64-unknown-none")
        .compile("boot");

    println!("cargo:rustc-link-search=native={}", out_dir.display());
    println!("cargo:rustc-link-lib=static:+whole-archive=boot");
}
