// File enumeration and output path resolution

use std::path::{Component, Path, PathBuf};

use anyhow::Result;
use thiserror::Error;
use walkdir::WalkDir;

/// Source extensions the scanner picks up (case-insensitive).
pub const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "mkv", "ts", "avi", "rm", "rmvb", "wmv", "m2ts", "mpeg", "mpg", "mov", "flv", "3gp",
    "webm", "m4v", "vob", "ogv", "f4v",
];

/// All outputs are remuxed into mp4.
pub const OUTPUT_EXTENSION: &str = "mp4";

/// Temp files sit next to the final output under this prefix so the rename
/// stays on one filesystem.
pub const TEMP_PREFIX: &str = "tmp_";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("input {input} resolves outside the input root {root}")]
    InputEscapesRoot { input: PathBuf, root: PathBuf },

    #[error("computed output {output} escapes the output root {root}")]
    OutputEscapesRoot { output: PathBuf, root: PathBuf },

    #[error("cannot resolve {path}: {message}")]
    Unresolvable { path: PathBuf, message: String },
}

pub fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| VIDEO_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Recursively collect video files under `root`. Sorted so runs are
/// deterministic regardless of readdir order. Symlinks are not followed.
pub fn scan(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_file() && is_video_file(e.path()))
        .map(|e| e.path().to_path_buf())
        .collect();
    files.sort();
    Ok(files)
}

/// Final output path and its sibling temp path for one input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedPaths {
    pub output: PathBuf,
    pub temp: PathBuf,
}

/// Map an input file to its output and temp paths.
///
/// The input is resolved through symlinks and must land inside the input
/// root; the computed output is normalized lexically and must stay inside the
/// output root. Either violation fails the task before any subprocess runs.
pub fn resolve_output_paths(
    input: &Path,
    input_root: &Path,
    output_root: &Path,
    keep_structure: bool,
) -> Result<PlannedPaths, PathError> {
    let canon_input = input
        .canonicalize()
        .map_err(|e| PathError::Unresolvable {
            path: input.to_path_buf(),
            message: e.to_string(),
        })?;
    let canon_root = input_root
        .canonicalize()
        .map_err(|e| PathError::Unresolvable {
            path: input_root.to_path_buf(),
            message: e.to_string(),
        })?;

    let relative = canon_input
        .strip_prefix(&canon_root)
        .map_err(|_| PathError::InputEscapesRoot {
            input: input.to_path_buf(),
            root: input_root.to_path_buf(),
        })?;

    let mapped = if keep_structure {
        output_root.join(relative)
    } else {
        match input.file_name() {
            Some(name) => output_root.join(name),
            None => {
                return Err(PathError::Unresolvable {
                    path: input.to_path_buf(),
                    message: "no file name".to_string(),
                });
            }
        }
    };
    let output = lexical_normalize(&mapped.with_extension(OUTPUT_EXTENSION));

    // The output tree usually does not exist yet, so this check is lexical.
    if !output.starts_with(lexical_normalize(output_root)) {
        return Err(PathError::OutputEscapesRoot {
            output,
            root: output_root.to_path_buf(),
        });
    }

    let file_name = output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = output.with_file_name(format!("{TEMP_PREFIX}{file_name}"));

    Ok(PlannedPaths { output, temp })
}

/// Resolve `.` and `..` components without touching the filesystem.
fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(Component::ParentDir);
                }
            }
            other => out.push(other),
        }
    }
    out
}
