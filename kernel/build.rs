fn main() {
    // The linker script only applies to the bare-metal kernel build; host
    // builds of the workspace compile this crate to an empty binary.
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("none") {
        let dir = std::env::var("CARGO_MANIFEST_DIR").unwrap();
        println!("cargo:rustc-link-arg=-T{dir}/kernel.ld");
    }
    println!("cargo:rerun-if-changed=kernel.ld");
    println!("cargo:rerun-if-changed=src/entry.s");
    println!("cargo:rerun-if-changed=src/interrupt/kernel_vec.s");
    println!("cargo:rerun-if-changed=src/interrupt/trampoline.s");
}
