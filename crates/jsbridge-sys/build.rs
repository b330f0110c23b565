use std::env;
use std::fs;
use std::path::{Path, PathBuf};

// Prebuilt JavaScriptCore from oven-sh/WebKit releases
const BUN_WEBKIT_VERSION: &str = "aaf3f80b1cc701b412f8abfb7c7f413644a229ff";

fn main() {
    println!("cargo:rustc-check-cfg=cfg(has_bmalloc)");
    println!("cargo:rerun-if-env-changed=BUN_WEBKIT_VERSION");
    println!("cargo:rerun-if-env-changed=JSBRIDGE_WEBKIT_DIR");

    let target_os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    let target_arch = env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default();

    match target_os.as_str() {
        "macos" | "ios" => link_system_framework(),
        "linux" => {
            let webkit = webkit_dir("linux", &target_arch);
            link_static_webkit(&webkit);
            for lib in ["stdc++", "atomic", "dl", "pthread", "m"] {
                println!("cargo:rustc-link-lib={}", lib);
            }
        }
        "windows" => {
            let webkit = webkit_dir("windows", &target_arch);
            link_static_webkit(&webkit);
            for lib in [
                "winmm", "bcrypt", "ntdll", "userenv", "dbghelp", "crypt32", "wsock32", "ws2_32",
                "advapi32", "ole32", "oleaut32", "uuid", "shell32",
            ] {
                println!("cargo:rustc-link-lib={}", lib);
            }
            println!("cargo:rustc-link-arg=/NODEFAULTLIB:libcmt");
            println!("cargo:rustc-link-lib=msvcrt");
        }
        other => panic!("JavaScriptCore is not available for target OS {}", other),
    }
}

fn link_system_framework() {
    println!("cargo:rustc-link-lib=framework=JavaScriptCore");

    if let Ok(output) = std::process::Command::new("xcrun")
        .args(["--show-sdk-path"])
        .output()
    {
        let sdk = String::from_utf8_lossy(&output.stdout);
        println!(
            "cargo:rustc-link-search=framework={}/System/Library/Frameworks",
            sdk.trim()
        );
    }
}

/// Resolve the directory holding a prebuilt bun-webkit tree.
///
/// `JSBRIDGE_WEBKIT_DIR` points at an already extracted tree and skips the
/// download entirely.
fn webkit_dir(os: &str, target_arch: &str) -> PathBuf {
    if let Ok(dir) = env::var("JSBRIDGE_WEBKIT_DIR") {
        return PathBuf::from(dir);
    }

    let arch = match (os, target_arch) {
        (_, "x86_64") => "amd64",
        ("linux", "aarch64") => "arm64",
        _ => panic!("no prebuilt bun-webkit for {}-{}", os, target_arch),
    };

    let version = env::var("BUN_WEBKIT_VERSION").unwrap_or_else(|_| BUN_WEBKIT_VERSION.into());
    let dir = cache_root().join(&version).join(format!("{}-{}", os, arch));
    let marker = dir.join(".downloaded");
    if marker.exists() {
        return dir;
    }

    let url = format!(
        "https://github.com/oven-sh/WebKit/releases/download/autobuild-{}/bun-webkit-{}-{}.tar.gz",
        version, os, arch
    );
    println!("cargo:warning=Downloading bun-webkit from {}", url);

    fs::create_dir_all(&dir).expect("failed to create bun-webkit cache directory");
    let response = ureq::get(&url)
        .call()
        .unwrap_or_else(|e| panic!("failed to download bun-webkit from {}: {}", url, e));

    // Stream straight into the decoder; the archive is several hundred MB.
    let reader = response.into_body().into_reader();
    tar::Archive::new(flate2::read::GzDecoder::new(reader))
        .unpack(&dir)
        .expect("failed to extract bun-webkit archive");
    fs::write(&marker, "").expect("failed to write download marker");

    dir
}

fn link_static_webkit(webkit: &Path) {
    let lib_dir = find_lib_dir(webkit);
    println!("cargo:rustc-link-search=native={}", lib_dir.display());
    println!("cargo:rustc-link-lib=static=JavaScriptCore");
    println!("cargo:rustc-link-lib=static=WTF");

    if has_lib(&lib_dir, "bmalloc") {
        println!("cargo:rustc-link-lib=static=bmalloc");
        println!("cargo:rustc-cfg=has_bmalloc");
    }

    // Windows builds ship ICU as sicu*.
    let icu: &[&str] = if has_lib(&lib_dir, "icudata") {
        &["icudata", "icui18n", "icuuc"]
    } else if has_lib(&lib_dir, "sicudt") {
        &["sicudt", "sicuin", "sicuuc"]
    } else {
        println!("cargo:warning=ICU libraries not found in {}", lib_dir.display());
        &[]
    };
    for lib in icu {
        println!("cargo:rustc-link-lib=static={}", lib);
    }

    let include = webkit.join("include");
    if include.exists() {
        println!("cargo:include={}", include.display());
    }
}

fn find_lib_dir(webkit: &Path) -> PathBuf {
    let direct = webkit.join("lib");
    if direct.exists() {
        return direct;
    }

    fs::read_dir(webkit)
        .into_iter()
        .flatten()
        .flatten()
        .map(|entry| entry.path().join("lib"))
        .find(|lib| lib.exists())
        .unwrap_or_else(|| webkit.to_path_buf())
}

fn has_lib(dir: &Path, name: &str) -> bool {
    let prefixed = format!("lib{}", name);
    fs::read_dir(dir)
        .into_iter()
        .flatten()
        .flatten()
        .filter_map(|entry| entry.file_name().into_string().ok())
        .any(|file| {
            (file.starts_with(name) || file.starts_with(&prefixed))
                && (file.ends_with(".a") || file.ends_with(".lib"))
        })
}

fn cache_root() -> PathBuf {
    if let Ok(cargo_home) = env::var("CARGO_HOME") {
        return PathBuf::from(cargo_home).join("cache").join("bun-webkit");
    }
    if let Some(home) = env::var_os("HOME").or_else(|| env::var_os("USERPROFILE")) {
        return PathBuf::from(home).join(".cargo").join("cache").join("bun-webkit");
    }
    PathBuf::from(env::var("OUT_DIR").unwrap_or_else(|_| ".".into())).join("bun-webkit-cache")
}
