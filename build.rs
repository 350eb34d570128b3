use std::env;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let target_os = env::var("CARGO_CFG_TARGET_OS").unwrap();
    if target_os != "linux" {
        panic!("Current OS {} is not supported", target_os);
    }

    // getcontext/makecontext/swapcontext are glibc only
    let target_env = env::var("CARGO_CFG_TARGET_ENV").unwrap_or_default();
    if target_env != "gnu" {
        panic!("Current target environment {:?} is not supported", target_env);
    }

    let target_arch = env::var("CARGO_CFG_TARGET_ARCH").unwrap();
    match &*target_arch {
        "x86_64" | "aarch64" => (),
        _ => {
            panic!("Current architecture {} is not supported", target_arch);
        }
    }
}
