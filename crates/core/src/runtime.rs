//! ONNX Runtime shared-library discovery.
//!
//! `ort` is built with `load-dynamic`, so the runtime (and, for GPU
//! execution providers, the CUDA / cuDNN / TensorRT libraries) has to be
//! located before the first session is created.

use std::env;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

pub const ENV_ORT_DYLIB_PATH: &str = "ORT_DYLIB_PATH";
pub const ENV_LIB_DIR: &str = "TESSERA_LIB_DIR";

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

/// Probes, in order:
///   1. `$TESSERA_LIB_DIR`
///   2. `<exe_dir>/` (Windows only)
///   3. `<exe_dir>/lib/`
///   4. `<exe_dir>/../lib/`
///   5. `<cwd>/lib/`
///   6. `/usr/local/lib/`, `/usr/lib/` (Unix only)
pub fn candidate_lib_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    let mut push = |dir: PathBuf| {
        if !dirs.contains(&dir) {
            dirs.push(dir);
        }
    };

    if let Some(dir) = env::var_os(ENV_LIB_DIR).filter(|v| !v.is_empty()) {
        push(PathBuf::from(dir));
    }
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            #[cfg(windows)]
            push(exe_dir.to_path_buf());
            push(exe_dir.join("lib"));
            if let Some(parent) = exe_dir.parent() {
                push(parent.join("lib"));
            }
        }
    }
    if let Ok(cwd) = env::current_dir() {
        push(cwd.join("lib"));
    }
    #[cfg(unix)]
    {
        push(PathBuf::from("/usr/local/lib"));
        push(PathBuf::from("/usr/lib"));
    }
    dirs
}

pub fn find_ort_dylib_in_dirs(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(ORT_LIB_NAME))
        .find(|candidate| candidate.is_file())
}

/// Load tier for GPU runtime libraries, `None` for anything that must not be
/// preloaded. ORT's own provider libraries need symbols from the runtime
/// itself, which `ort` loads later.
///
///   0: CUDA runtime, cuBLAS
///   1: cuDNN
///   2: TensorRT
#[cfg(unix)]
fn load_priority(name: &str) -> Option<u8> {
    let name = name.to_ascii_lowercase();
    if name.starts_with("libcudart") || name.starts_with("libcublas") {
        Some(0)
    } else if name.starts_with("libcudnn") {
        Some(1)
    } else if name.starts_with("libnvinfer") || name.starts_with("libnvonnxparser") {
        Some(2)
    } else {
        None
    }
}

#[cfg(windows)]
fn load_priority(name: &str) -> Option<u8> {
    let name = name.to_ascii_lowercase();
    if name.starts_with("cudart64_") || name.starts_with("cublas") {
        Some(0)
    } else if name.starts_with("cudnn64_") {
        Some(1)
    } else if name.starts_with("nvinfer") || name.starts_with("nvonnxparser") {
        Some(2)
    } else {
        None
    }
}

#[cfg(unix)]
fn is_candidate_lib(name: &str, path: &Path) -> bool {
    name.contains(".so") && !path.is_symlink()
}

#[cfg(windows)]
fn is_candidate_lib(_name: &str, path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("dll"))
}

/// GPU libraries found in `dirs`, deduplicated by file name (first directory
/// wins) and sorted so dependencies come before dependents.
fn collect_preload_libs(dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut seen: Vec<String> = Vec::new();
    let mut libs: Vec<(u8, String, PathBuf)> = Vec::new();

    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for path in entries.flatten().map(|entry| entry.path()) {
            let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
                continue;
            };
            if !is_candidate_lib(&name, &path) || seen.contains(&name) {
                continue;
            }
            let Some(priority) = load_priority(&name) else {
                continue;
            };
            seen.push(name.clone());
            libs.push((priority, name, path));
        }
    }

    libs.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    libs.into_iter().map(|(_, _, path)| path).collect()
}

// glibc reads LD_LIBRARY_PATH once at startup, so the GPU libraries are
// loaded by absolute path into the global namespace instead.
#[cfg(unix)]
unsafe fn load_library(path: &Path) -> bool {
    match libloading::os::unix::Library::open(Some(path), libc::RTLD_LAZY | libc::RTLD_GLOBAL) {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

#[cfg(windows)]
unsafe fn load_library(path: &Path) -> bool {
    match libloading::Library::new(path) {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

/// Call at the very start of `main()`, before tracing or any ORT use.
pub fn setup_runtime_libs() {
    let dirs = candidate_lib_dirs();

    if env::var_os(ENV_ORT_DYLIB_PATH).is_none() {
        if let Some(path) = find_ort_dylib_in_dirs(&dirs) {
            env::set_var(ENV_ORT_DYLIB_PATH, &path);
        }
    }

    for lib in collect_preload_libs(&dirs) {
        // SAFETY: these are vendor GPU runtime libraries whose initializers
        // have no preconditions on our process state.
        unsafe {
            load_library(&lib);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeLibStatus {
    pub ort_dylib: Option<PathBuf>,
    pub ort_dylib_exists: bool,
    pub gpu_libs: Vec<PathBuf>,
}

pub fn runtime_lib_status() -> RuntimeLibStatus {
    let ort_dylib = env::var_os(ENV_ORT_DYLIB_PATH).map(PathBuf::from);
    let ort_dylib_exists = ort_dylib.as_deref().is_some_and(Path::is_file);
    RuntimeLibStatus {
        ort_dylib,
        ort_dylib_exists,
        gpu_libs: collect_preload_libs(&candidate_lib_dirs()),
    }
}

/// Call after tracing is initialized.
pub fn log_runtime_lib_status() {
    let status = runtime_lib_status();
    match (&status.ort_dylib, status.ort_dylib_exists) {
        (Some(path), true) => info!("ORT library: {}", path.display()),
        (Some(path), false) => warn!(
            "{ENV_ORT_DYLIB_PATH} set to {} but file not found",
            path.display()
        ),
        (None, _) => warn!("{ENV_ORT_DYLIB_PATH} not set, ORT will try default search paths"),
    }
    debug!(count = status.gpu_libs.len(), "GPU runtime libraries found");
}
