//! Build script for avbind-core
//!
//! This script:
//! 1. Locates the libav* libraries using pkg-config
//! 2. Generates the C header for the `avb_*` surface using cbindgen

use std::env;
use std::path::{Path, PathBuf};

fn main() {
    println!("cargo:rerun-if-changed=src/ffi/");
    println!("cargo:rerun-if-changed=cbindgen.toml");

    let out_dir = env::var("OUT_DIR").expect("OUT_DIR not set");
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR not set");

    find_ffmpeg_libs();
    generate_header(&manifest_dir, &out_dir);
}

/// Find the libav* libraries using pkg-config or fallback paths
fn find_ffmpeg_libs() {
    // (library, minimum version): FFmpeg 6.1+, for AV_FRAME_FLAG_KEY
    let libs = [
        ("libavutil", "58.29.0"),
        ("libavcodec", "60.31.0"),
        ("libavformat", "60.16.0"),
    ];

    let mut found_all = true;
    for (lib, version) in &libs {
        match pkg_config::Config::new().atleast_version(version).probe(lib) {
            Ok(library) => {
                println!("cargo:info=Found {} {} via pkg-config", lib, library.version);
                for path in &library.link_paths {
                    println!("cargo:rustc-link-search=native={}", path.display());
                }
            }
            Err(e) => {
                println!("cargo:warning=pkg-config failed for {}: {}", lib, e);
                found_all = false;
            }
        }
    }

    if !found_all {
        try_fallback_paths();
    }
}

/// Try common libav* installation paths
fn try_fallback_paths() {
    let lib_paths = [
        "/usr/lib/x86_64-linux-gnu",
        "/usr/lib/aarch64-linux-gnu",
        "/usr/local/lib",
        "/opt/homebrew/opt/ffmpeg/lib",
        "/opt/homebrew/lib",
        "/usr/local/opt/ffmpeg/lib",
    ];

    for path in &lib_paths {
        if Path::new(path).exists() {
            println!("cargo:rustc-link-search=native={}", path);
            println!("cargo:info=Added link path: {}", path);
        }
    }

    println!("cargo:rustc-link-lib=dylib=avcodec");
    println!("cargo:rustc-link-lib=dylib=avformat");
    println!("cargo:rustc-link-lib=dylib=avutil");
}

/// Generate the C header using cbindgen
fn generate_header(manifest_dir: &str, out_dir: &str) {
    let crate_dir = PathBuf::from(manifest_dir);
    let config_path = crate_dir.join("cbindgen.toml");
    let header_out = PathBuf::from(out_dir).join("avbind.h");

    let config = if config_path.exists() {
        cbindgen::Config::from_file(&config_path).unwrap_or_default()
    } else {
        cbindgen::Config::default()
    };

    match cbindgen::Builder::new()
        .with_crate(&crate_dir)
        .with_config(config)
        .generate()
    {
        Ok(bindings) => {
            bindings.write_to_file(&header_out);
            println!("cargo:info=Generated header: {}", header_out.display());
        }
        Err(e) => {
            println!("cargo:warning=cbindgen failed: {}", e);
            create_fallback_header(&header_out);
        }
    }
}

/// Create a minimal fallback header if cbindgen fails
fn create_fallback_header(header_path: &Path) {
    let header_content = r#"
#ifndef AVBIND_H
#define AVBIND_H

#include <stdint.h>
#include <stdbool.h>
#include <stddef.h>

// Note: This is a fallback header. Build with cbindgen for the full API.

typedef enum {
    AvbResultSuccess = 0,
    AvbResultErrorInvalidArgument = 1,
    AvbResultErrorFreedResource = 2,
    AvbResultErrorNative = 3,
    AvbResultErrorAllocation = 4,
    AvbResultErrorBorrowed = 5,
    AvbResultErrorReadOnly = 6,
    AvbResultErrorNotFound = 7,
    AvbResultErrorInvalidHandle = 8,
    AvbResultErrorUnknown = 99,
} AvbResult;

typedef struct AvbBufferHandle AvbBufferHandle;
typedef struct AvbPoolHandle AvbPoolHandle;
typedef struct AvbDictHandle AvbDictHandle;

typedef void (*AvbReleaseCallback)(void* opaque, uint8_t* data);

// Library
void avb_init(void);
const char* avb_get_last_error(void);
int32_t avb_get_last_error_code(void);
void avb_clear_last_error(void);
const char* avb_get_version(void);
const char* avb_get_ffmpeg_version(void);
void avb_string_free(char* s);

// Buffers
AvbBufferHandle* avb_buffer_alloc(int64_t size, bool zeroed);
AvbBufferHandle* avb_buffer_from_bytes(const uint8_t* data, size_t len);
AvbBufferHandle* avb_buffer_wrap(uint8_t* data, size_t len,
                                 AvbReleaseCallback release, void* opaque);
int64_t avb_buffer_size(const AvbBufferHandle* handle);
int64_t avb_buffer_read(const AvbBufferHandle* handle, uint8_t* out, size_t capacity);
AvbResult avb_buffer_write(const AvbBufferHandle* handle, size_t offset,
                           const uint8_t* data, size_t len);
uint32_t avb_buffer_ref_count(const AvbBufferHandle* handle);
bool avb_buffer_is_writable(const AvbBufferHandle* handle);
AvbResult avb_buffer_make_writable(const AvbBufferHandle* handle);
AvbResult avb_buffer_realloc(const AvbBufferHandle* handle, int64_t size);
AvbBufferHandle* avb_buffer_new_reference(const AvbBufferHandle* handle);
void avb_buffer_free(const AvbBufferHandle* handle);
bool avb_buffer_is_freed(const AvbBufferHandle* handle);
void avb_buffer_release(AvbBufferHandle* handle);

// Buffer pools
AvbPoolHandle* avb_pool_create(int64_t buffer_size);
AvbBufferHandle* avb_pool_get(const AvbPoolHandle* handle);
void avb_pool_free(const AvbPoolHandle* handle);
bool avb_pool_is_freed(const AvbPoolHandle* handle);
void avb_pool_release(AvbPoolHandle* handle);

// Dictionaries
AvbDictHandle* avb_dict_create(void);
AvbResult avb_dict_set(const AvbDictHandle* handle, const char* key,
                       const char* value, int32_t flags);
char* avb_dict_get(const AvbDictHandle* handle, const char* key, int32_t flags);
int32_t avb_dict_count(const AvbDictHandle* handle);
void avb_dict_release(AvbDictHandle* handle);

#endif // AVBIND_H
"#;

    std::fs::write(header_path, header_content).expect("Failed to write fallback header");
    println!("cargo:info=Created fallback header: {}", header_path.display());
}
