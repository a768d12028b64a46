use std::env;
use std::path::{Path, PathBuf};

fn main() {
    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let target_os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    let apple = target_os == "macos" || target_os == "ios";

    println!("cargo:rerun-if-env-changed=LLAMA_CPP_DIR");
    println!("cargo:rerun-if-env-changed=LLAMA_PREBUILT_DIR");

    let llama_cpp_dir = env::var("LLAMA_CPP_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| manifest_dir.join("../../third_party/llama.cpp"));

    // ── Locate or build llama.cpp ─────────────────────────────────────
    //
    // `LLAMA_PREBUILT_DIR` points at an install tree (`lib/` + `include/`),
    // which is what the Xcode build phase produces for device/simulator
    // slices. Otherwise llama.cpp is built from `LLAMA_CPP_DIR` (default
    // `third_party/llama.cpp`) with CMake as static libraries.

    let (lib_dir, include_dir) = match env::var("LLAMA_PREBUILT_DIR") {
        Ok(prebuilt) => {
            let prebuilt = PathBuf::from(prebuilt);
            assert!(
                prebuilt.exists(),
                "LLAMA_PREBUILT_DIR={} does not exist",
                prebuilt.display()
            );
            println!(
                "cargo:warning=Using prebuilt llama.cpp from {}",
                prebuilt.display()
            );
            (lib_subdir(&prebuilt), prebuilt.join("include"))
        }
        Err(_) => {
            assert!(
                llama_cpp_dir.join("CMakeLists.txt").exists(),
                "llama.cpp source not found at {}. \
                 Run `git submodule update --init --recursive` or set LLAMA_CPP_DIR.",
                llama_cpp_dir.display()
            );

            let mut cfg = cmake::Config::new(&llama_cpp_dir);
            cfg.define("BUILD_SHARED_LIBS", "OFF")
                .define("LLAMA_BUILD_SERVER", "OFF")
                .define("LLAMA_BUILD_TESTS", "OFF")
                .define("LLAMA_BUILD_EXAMPLES", "OFF")
                .define("LLAMA_BUILD_TOOLS", "OFF")
                .define("LLAMA_BUILD_COMMON", "OFF")
                .define("LLAMA_CURL", "OFF");

            if apple && metal_enabled() {
                cfg.define("GGML_METAL", "ON")
                    .define("GGML_METAL_EMBED_LIBRARY", "ON");
            } else {
                cfg.define("GGML_METAL", "OFF");
            }
            if target_os == "ios" {
                cfg.define("CMAKE_SYSTEM_NAME", "iOS")
                    .define("GGML_OPENMP", "OFF");
            }
            if env::var("CARGO_FEATURE_CUDA").is_ok() {
                cfg.define("GGML_CUDA", "ON");
            }
            if env::var("CARGO_FEATURE_VULKAN").is_ok() {
                cfg.define("GGML_VULKAN", "ON");
            }

            let dst = cfg.build();
            (lib_subdir(&dst), dst.join("include"))
        }
    };

    // ── Link libraries ────────────────────────────────────────────────
    println!("cargo:rustc-link-search=native={}", lib_dir.display());
    println!("cargo:rustc-link-lib=static=llama");

    for name in &["ggml", "ggml-base", "ggml-cpu", "ggml-blas"] {
        if lib_dir.join(format!("lib{name}.a")).exists() {
            println!("cargo:rustc-link-lib=static={name}");
        }
    }

    if env::var("CARGO_FEATURE_CUDA").is_ok() && lib_dir.join("libggml-cuda.a").exists() {
        println!("cargo:rustc-link-lib=static=ggml-cuda");
        for lib in &["cuda", "cublas", "culibos", "cudart"] {
            println!("cargo:rustc-link-lib={lib}");
        }
    }
    if env::var("CARGO_FEATURE_VULKAN").is_ok() && lib_dir.join("libggml-vulkan.a").exists() {
        println!("cargo:rustc-link-lib=static=ggml-vulkan");
        println!("cargo:rustc-link-lib=vulkan");
    }

    match target_os.as_str() {
        "linux" => {
            println!("cargo:rustc-link-lib=stdc++");
            println!("cargo:rustc-link-lib=m");
            println!("cargo:rustc-link-lib=pthread");
            println!("cargo:rustc-link-lib=gomp");
        }
        "macos" | "ios" => {
            if lib_dir.join("libggml-metal.a").exists() {
                println!("cargo:rustc-link-lib=static=ggml-metal");
            }
            for fw in &["Accelerate", "Metal", "MetalKit", "Foundation"] {
                println!("cargo:rustc-link-lib=framework={fw}");
            }
            println!("cargo:rustc-link-lib=c++");
        }
        "windows" => {
            println!("cargo:rustc-link-lib=msvcrt");
        }
        _ => {}
    }

    // ── Generate Rust bindings ────────────────────────────────────────
    let mut builder = bindgen::Builder::default()
        .header("wrapper.h")
        .clang_arg(format!("-I{}", include_dir.display()));

    let ggml_include = llama_cpp_dir.join("ggml/include");
    if ggml_include.exists() {
        builder = builder.clang_arg(format!("-I{}", ggml_include.display()));
    }
    if target_os == "ios" {
        // bindgen does not pick the iOS SDK up on its own.
        if let Ok(sdk) = env::var("SDKROOT") {
            builder = builder.clang_arg(format!("-isysroot{sdk}"));
        }
    }

    let bindings = builder
        .allowlist_function("llama_.*")
        .allowlist_function("ggml_.*")
        .allowlist_type("llama_.*")
        .allowlist_type("ggml_.*")
        .allowlist_var("LLAMA_.*")
        .allowlist_var("GGML_.*")
        .derive_default(true)
        .size_t_is_usize(true)
        .generate()
        .expect("Failed to generate bindings");

    let out = PathBuf::from(env::var("OUT_DIR").unwrap());
    bindings
        .write_to_file(out.join("bindings.rs"))
        .expect("Failed to write bindings");

    println!("cargo:rerun-if-changed=wrapper.h");
}

/// Metal needs the `metal` feature and an Apple target. `LLAMA_NO_METAL=1`
/// turns it off for a build that has the feature on (the iOS simulator has
/// no usable Metal device on older hosts).
fn metal_enabled() -> bool {
    println!("cargo:rerun-if-env-changed=LLAMA_NO_METAL");
    env::var("CARGO_FEATURE_METAL").is_ok() && env::var("LLAMA_NO_METAL").is_err()
}

fn lib_subdir(root: &Path) -> PathBuf {
    if root.join("lib64").exists() {
        root.join("lib64")
    } else {
        root.join("lib")
    }
}
