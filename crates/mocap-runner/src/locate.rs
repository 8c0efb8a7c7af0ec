use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq)]
pub enum LocateError {
    #[error("No matching log found for {name} in {}", .dir.display())]
    NotFound { dir: PathBuf, name: String },
    #[error(
        "No matching log found for {name} in {}: prefix '{prefix}' matches {} files",
        .dir.display(),
        .candidates.len()
    )]
    Ambiguous {
        dir: PathBuf,
        name: String,
        prefix: String,
        candidates: Vec<PathBuf>,
    },
    #[error("cannot list log directory {}: {message}", .dir.display())]
    Unreadable { dir: PathBuf, message: String },
}

/// Find the side log for a recording named `name` in `dir`.
///
/// An exact file name wins. Otherwise the name is shortened one character
/// at a time (at most `max_strip` times, never to nothing) and the files
/// starting with the remaining prefix are collected. The first depth with
/// exactly one candidate decides. A shorter prefix can only match more
/// files, so the first depth with several candidates ends the search.
pub fn locate_log(dir: &Path, name: &str, max_strip: usize) -> Result<PathBuf, LocateError> {
    let exact = dir.join(name);
    if exact.is_file() {
        return Ok(exact);
    }

    let entries = list_files(dir)?;
    let chars: Vec<char> = name.chars().collect();
    for strip in 1..=max_strip.min(chars.len().saturating_sub(1)) {
        let prefix: String = chars[..chars.len() - strip].iter().collect();
        let mut candidates: Vec<PathBuf> = entries
            .iter()
            .filter(|(file_name, _)| file_name.starts_with(&prefix))
            .map(|(_, path)| path.clone())
            .collect();
        match candidates.len() {
            0 => continue,
            1 => {
                let found = candidates.remove(0);
                debug!(name, prefix = %prefix, found = %found.display(), "matched log by prefix");
                return Ok(found);
            }
            _ => {
                candidates.sort();
                return Err(LocateError::Ambiguous {
                    dir: dir.to_path_buf(),
                    name: name.to_string(),
                    prefix,
                    candidates,
                });
            }
        }
    }
    Err(LocateError::NotFound {
        dir: dir.to_path_buf(),
        name: name.to_string(),
    })
}

fn list_files(dir: &Path) -> Result<Vec<(String, PathBuf)>, LocateError> {
    let unreadable = |e: std::io::Error| LocateError::Unreadable {
        dir: dir.to_path_buf(),
        message: e.to_string(),
    };
    let mut out = Vec::new();
    for entry in fs::read_dir(dir).map_err(unreadable)? {
        let entry = entry.map_err(unreadable)?;
        if !entry.file_type().map_err(unreadable)?.is_file() {
            continue;
        }
        if let Some(file_name) = entry.file_name().to_str() {
            out.push((file_name.to_string(), entry.path()));
        }
    }
    Ok(out)
}
