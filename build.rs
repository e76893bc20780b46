use std::fs;
use std::path::{Path, PathBuf};

fn main() {
    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR missing");
    let src = Path::new(&manifest_dir).join("src");
    for core_dir in ["crypto", "onion"] {
        let dir = src.join(core_dir);
        println!("cargo:rerun-if-changed={}", dir.display());
        if !dir.exists() {
            continue;
        }
        let mut files = Vec::new();
        collect_rs_files(&dir, &mut files);
        for path in files {
            let contents = fs::read_to_string(&path)
                .unwrap_or_else(|e| panic!("Failed to read {}: {}", path.display(), e));
            enforce_pure_core(&contents, &path);
        }
    }
}

/// Every `.rs` file below `root`, walked with an explicit stack.
fn collect_rs_files(root: &Path, files: &mut Vec<PathBuf>) {
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for path in entries.flatten().map(|entry| entry.path()) {
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().is_some_and(|ext| ext == "rs") {
                files.push(path);
            }
        }
    }
    files.sort();
}

// The onion core must stay side-effect free: no runtime, no sockets, no clocks,
// and no randomness that the caller did not hand in.
fn enforce_pure_core(contents: &str, path: &Path) {
    let forbidden = [
        "tokio",
        "reqwest",
        "std::net",
        "SystemTime",
        "Instant",
        "OsRng",
        "thread_rng",
        "println!(",
        "eprintln!(",
        "tracing::",
    ];

    for token in forbidden {
        if contents.contains(token) {
            panic!(
                "Forbidden token `{}` in onion core module: {}",
                token,
                path.display()
            );
        }
    }
}
