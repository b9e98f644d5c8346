fn main() {
    println!("cargo:rerun-if-changed=linker.ld");

    // The linker script only applies to the freestanding kernel image.
    let target = std::env::var("TARGET").unwrap();
    if target == "x86_64-unknown-none" {
        let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").unwrap();
        println!("cargo:rustc-link-arg-bins=-T{manifest_dir}/linker.ld");
    }
}
