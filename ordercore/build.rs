// Fails the build when ordercore sources suppress lints ("#[" + "allow" + ...).
// Set CHECK_NO_ALLOW=0 to skip the scan.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

fn main() {
    println!("cargo:rerun-if-env-changed=CHECK_NO_ALLOW");
    println!("cargo:rerun-if-changed=src");
    println!("cargo:rerun-if-changed=tests");

    if env::var("CHECK_NO_ALLOW").is_ok_and(|v| v == "0") {
        return;
    }

    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").expect("manifest dir"));
    let mut violations = Vec::new();
    for relative in ["src", "tests"] {
        let path = manifest_dir.join(relative);
        if path.exists() {
            scan(&path, &mut violations);
        }
    }

    if violations.is_empty() {
        return;
    }

    eprintln!("ERROR: lint suppression attributes found in ordercore:");
    for (file, line, content) in &violations {
        eprintln!("  {}:{}: {}", file.display(), line, content.trim());
    }
    panic!("lint suppression attributes are forbidden");
}

fn scan(path: &Path, violations: &mut Vec<(PathBuf, usize, String)>) {
    if path.is_dir() {
        for entry in fs::read_dir(path).expect("read dir") {
            scan(&entry.expect("dir entry").path(), violations);
        }
        return;
    }

    if path.extension().map_or(true, |ext| ext != "rs") {
        return;
    }

    let needle = concat!("#[", "allow");
    let inner_needle = concat!("#![", "allow");
    if let Ok(content) = fs::read_to_string(path) {
        for (idx, line) in content.lines().enumerate() {
            if line.contains(needle) || line.contains(inner_needle) {
                violations.push((path.to_path_buf(), idx + 1, line.to_string()));
            }
        }
    }
}
