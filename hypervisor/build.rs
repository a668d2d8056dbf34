// =============================================================================
// raspvisor - Hypervisor Build Script
// =============================================================================
// Links the bare-metal binary with linker.ld. Host builds (unit tests) use
// the normal host link.
// =============================================================================

use std::env;
use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let linker_script = manifest_dir.join("linker.ld");
    println!("cargo:rerun-if-changed={}", linker_script.display());

    if env::var("CARGO_CFG_TARGET_OS").unwrap_or_default() != "none" {
        return;
    }

    println!("cargo:rustc-link-arg-bins=-T{}", linker_script.display());
}
