//! Locates the native x264 and libyuv libraries.
//!
//! Both ship pkg-config metadata on common distributions; when probing
//! fails we fall back to plain `-l` flags and let the linker search the
//! system paths.

fn main() {
    if pkg_config::probe_library("x264").is_err() {
        println!("cargo:rustc-link-lib=x264");
    }
    if pkg_config::probe_library("libyuv").is_err() {
        println!("cargo:rustc-link-lib=yuv");
    }
}
