use std::path::{Component, Path, PathBuf};

use serde_json::json;

use crate::error::{EngineError, EngineResult, ErrorCode};

/// Rejects interior artifact names that could address files outside a run
/// root: absolute paths, `..` segments, and empty or `.` names.
pub fn ensure_relative_artifact(name: &str) -> EngineResult<()> {
    if name.is_empty() || name == "." {
        return Err(traversal(name, "artifact name resolves to the run root"));
    }
    let path = Path::new(name);
    for component in path.components() {
        match component {
            Component::Normal(_) => {}
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(traversal(name, "artifact name contains a '..' segment"));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(traversal(name, "artifact name is absolute"));
            }
        }
    }
    Ok(())
}

/// Resolves a relative artifact name against a run root and proves the
/// result stays inside it after following symlinks.
///
/// The deepest existing ancestor is canonicalized so a symlinked
/// intermediate directory cannot smuggle the target outside the root.
pub fn resolve_inside_root(root: &Path, relative: &str) -> EngineResult<PathBuf> {
    ensure_relative_artifact(relative)?;
    let canonical_root = canonicalize_existing(root)?;
    let joined = canonical_root.join(relative);

    let (existing, remainder) = deepest_existing_ancestor(&joined);
    let canonical_existing = canonicalize_existing(&existing)?;
    let resolved = canonical_existing.join(remainder);
    if !resolved.starts_with(&canonical_root) {
        return Err(traversal(
            relative,
            "artifact path escapes the run root after symlink resolution",
        ));
    }
    Ok(resolved)
}

/// Validates a wave directory: it must exist, be a real directory, and not
/// reach outside the run root through a symlink.
pub fn ensure_wave_dir(root: &Path, relative: &str) -> EngineResult<PathBuf> {
    ensure_relative_artifact(relative)?;
    let canonical_root = canonicalize_existing(root)?;
    let candidate = canonical_root.join(relative);
    let metadata = std::fs::symlink_metadata(&candidate).map_err(|_| {
        EngineError::new(
            ErrorCode::InvalidWaveDir,
            format!("wave directory '{relative}' does not exist"),
        )
        .with_details(json!({ "path": relative }))
    })?;
    if metadata.file_type().is_symlink() {
        return Err(EngineError::new(
            ErrorCode::WaveDirSymlink,
            format!("wave directory '{relative}' is a symlink"),
        )
        .with_details(json!({ "path": relative })));
    }
    if !metadata.is_dir() {
        return Err(EngineError::new(
            ErrorCode::InvalidWaveDir,
            format!("wave directory '{relative}' is not a directory"),
        )
        .with_details(json!({ "path": relative })));
    }
    let canonical = canonicalize_existing(&candidate)?;
    if !canonical.starts_with(&canonical_root) {
        return Err(EngineError::new(
            ErrorCode::WaveDirSymlink,
            format!("wave directory '{relative}' escapes the run root"),
        )
        .with_details(json!({ "path": relative })));
    }
    Ok(canonical)
}

fn canonicalize_existing(path: &Path) -> EngineResult<PathBuf> {
    std::fs::canonicalize(path).map_err(|error| {
        EngineError::new(
            ErrorCode::PathTraversal,
            format!("failed to canonicalize {}: {error}", path.display()),
        )
        .with_details(json!({ "path": path.display().to_string() }))
    })
}

fn deepest_existing_ancestor(path: &Path) -> (PathBuf, PathBuf) {
    let mut existing = path.to_path_buf();
    let mut remainder: Vec<std::ffi::OsString> = Vec::new();
    while !existing.exists() {
        let Some(name) = existing.file_name().map(|name| name.to_os_string()) else {
            break;
        };
        remainder.push(name);
        if !existing.pop() {
            break;
        }
    }
    let mut tail = PathBuf::new();
    for part in remainder.iter().rev() {
        tail.push(part);
    }
    (existing, tail)
}

fn traversal(name: &str, message: &str) -> EngineError {
    EngineError::new(ErrorCode::PathTraversal, format!("{message}: '{name}'"))
        .with_details(json!({ "path": name }))
}

#[cfg(test)]
mod tests {
    use super::{ensure_relative_artifact, ensure_wave_dir, resolve_inside_root};
    use crate::error::ErrorCode;

    #[test]
    fn unit_ensure_relative_artifact_accepts_plain_names() {
        ensure_relative_artifact("wave-1/agent_a.md").expect("plain name should pass");
        ensure_relative_artifact("manifest.json").expect("top-level name should pass");
    }

    #[test]
    fn regression_ensure_relative_artifact_rejects_traversal_shapes() {
        for name in ["../escape.md", "wave-1/../../escape.md", "/etc/passwd", "", "."] {
            let error = ensure_relative_artifact(name).expect_err("shape should fail");
            assert_eq!(error.code, ErrorCode::PathTraversal, "name {name:?}");
        }
    }

    #[test]
    fn functional_resolve_inside_root_resolves_missing_leaves() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let resolved = resolve_inside_root(tempdir.path(), "wave-1/agent_a.md")
            .expect("missing leaf should still resolve");
        assert!(resolved.starts_with(tempdir.path().canonicalize().expect("canonical root")));
    }

    #[cfg(unix)]
    #[test]
    fn regression_resolve_inside_root_rejects_symlink_escape() {
        let outside = tempfile::tempdir().expect("outside tempdir");
        let root = tempfile::tempdir().expect("root tempdir");
        std::os::unix::fs::symlink(outside.path(), root.path().join("wave-1"))
            .expect("symlink should be created");
        let error = resolve_inside_root(root.path(), "wave-1/agent_a.md")
            .expect_err("symlink escape should fail");
        assert_eq!(error.code, ErrorCode::PathTraversal);
    }

    #[cfg(unix)]
    #[test]
    fn regression_ensure_wave_dir_flags_symlinked_dir() {
        let outside = tempfile::tempdir().expect("outside tempdir");
        let root = tempfile::tempdir().expect("root tempdir");
        std::os::unix::fs::symlink(outside.path(), root.path().join("wave-1"))
            .expect("symlink should be created");
        let error = ensure_wave_dir(root.path(), "wave-1").expect_err("symlink dir should fail");
        assert_eq!(error.code, ErrorCode::WaveDirSymlink);
    }

    #[test]
    fn regression_ensure_wave_dir_requires_directory() {
        let root = tempfile::tempdir().expect("root tempdir");
        let missing = ensure_wave_dir(root.path(), "wave-1").expect_err("missing dir should fail");
        assert_eq!(missing.code, ErrorCode::InvalidWaveDir);

        std::fs::write(root.path().join("wave-1"), "file").expect("file should be written");
        let file = ensure_wave_dir(root.path(), "wave-1").expect_err("plain file should fail");
        assert_eq!(file.code, ErrorCode::InvalidWaveDir);
    }
}
