/// Archive Loader - Submission Extraction
///
/// **Core Responsibility:**
/// Unpack an untrusted project archive into a scratch workspace and
/// merge hidden test fixtures into the project's test tree.
///
/// **Safety Rules:**
/// - Every entry name is validated before anything is written
/// - One escaping entry rejects the whole archive
/// - Total uncompressed size is bounded

use crate::config::ProjectLayout;
use grader_common::HiddenTestSpec;
use std::fs;
use std::io::{self, Cursor, Read};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use zip::ZipArchive;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("security violation: {0}")]
    SecurityViolation(String),
    #[error("archive expands to more than {limit} bytes")]
    TooLarge { limit: u64 },
    #[error("malformed archive: {0}")]
    Malformed(#[from] zip::result::ZipError),
    #[error("workspace I/O failed: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct ArchiveLimits {
    pub max_uncompressed_bytes: u64,
}

/// Resolve an archive entry name against `dest` without touching the filesystem
///
/// `a/../b` is fine, `../b`, `/etc/passwd` and `C:\x` are not.
pub fn resolve_entry(dest: &Path, name: &str) -> Result<PathBuf, ArchiveError> {
    let unified = name.replace('\\', "/");
    let mut parts: Vec<&str> = Vec::new();

    for component in Path::new(&unified).components() {
        match component {
            Component::Normal(part) => {
                let part = part
                    .to_str()
                    .ok_or_else(|| ArchiveError::SecurityViolation(format!("non UTF-8 entry name: {}", name)))?;
                if part.contains(':') {
                    return Err(ArchiveError::SecurityViolation(format!("drive-qualified entry: {}", name)));
                }
                parts.push(part);
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(ArchiveError::SecurityViolation(format!("entry escapes workspace: {}", name)));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(ArchiveError::SecurityViolation(format!("absolute entry path: {}", name)));
            }
        }
    }

    Ok(parts.iter().fold(dest.to_path_buf(), |path, part| path.join(part)))
}

/// Extract `archive` into `dest`
///
/// Returns the number of file entries written.
pub fn extract(archive: &[u8], dest: &Path, limits: ArchiveLimits) -> Result<usize, ArchiveError> {
    let mut zip = ZipArchive::new(Cursor::new(archive))?;

    // First pass: validate every name and the total size before writing anything
    let mut targets = Vec::with_capacity(zip.len());
    let mut total_uncompressed: u64 = 0;
    for i in 0..zip.len() {
        let entry = zip.by_index_raw(i)?;
        total_uncompressed = total_uncompressed.saturating_add(entry.size());
        if total_uncompressed > limits.max_uncompressed_bytes {
            return Err(ArchiveError::TooLarge {
                limit: limits.max_uncompressed_bytes,
            });
        }
        targets.push((resolve_entry(dest, entry.name())?, entry.is_dir()));
    }

    let mut files = 0;
    let mut written: u64 = 0;
    for (i, (target, is_dir)) in targets.into_iter().enumerate() {
        if is_dir {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut entry = zip.by_index(i)?;
        let mut out = fs::File::create(&target)?;

        // Headers can lie about sizes; bound the actual bytes too
        let budget = limits.max_uncompressed_bytes - written;
        let copied = io::copy(&mut (&mut entry).take(budget + 1), &mut out)?;
        if copied > budget {
            return Err(ArchiveError::TooLarge {
                limit: limits.max_uncompressed_bytes,
            });
        }
        written += copied;
        files += 1;
    }

    debug!(files, bytes = total_uncompressed, "Archive extracted");
    Ok(files)
}

fn is_class_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

/// Write hidden fixtures into the layout's hidden test directory
///
/// Empty `fixtures` is a no-op. Returns the number of files written.
pub fn inject_hidden_tests(
    workspace: &Path,
    layout: &ProjectLayout,
    fixtures: &[HiddenTestSpec],
) -> Result<usize, ArchiveError> {
    if fixtures.is_empty() {
        return Ok(0);
    }

    for fixture in fixtures {
        if !is_class_name(&fixture.class_name) {
            return Err(ArchiveError::SecurityViolation(format!(
                "invalid hidden test class name: {:?}",
                fixture.class_name
            )));
        }
    }

    let test_dir = resolve_entry(workspace, &layout.hidden_tests_dir)?;
    fs::create_dir_all(&test_dir)?;

    for fixture in fixtures {
        let file_name = format!("{}.{}", fixture.class_name, layout.hidden_test_extension);
        fs::write(test_dir.join(file_name), &fixture.code)?;
    }

    Ok(fixtures.len())
}
