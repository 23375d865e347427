//! Bundle extraction.
//!
//! A bundle is a gzip-compressed tar of relative paths. Every entry path is
//! normalized with the shared containment check before anything is written;
//! one bad entry rejects the whole bundle. Links are refused outright, so
//! nothing extracted can point outside the staging directory.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;

use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use tar::{Archive, EntryType};
use tracing::debug;

use nimbus_core::config::DeployConfig;
use nimbus_core::containment::normalize_relative;

use crate::error::{DeployError, DeployResult};

/// Size ceilings applied while extracting.
#[derive(Debug, Clone, Copy)]
pub struct ExtractLimits {
    pub max_extracted_bytes: u64,
    pub max_files: u64,
}

impl From<&DeployConfig> for ExtractLimits {
    fn from(config: &DeployConfig) -> Self {
        Self {
            max_extracted_bytes: config.max_extracted_bytes,
            max_files: config.max_files,
        }
    }
}

/// What an extraction produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtractSummary {
    pub file_count: u64,
    pub extracted_bytes: u64,
}

/// Hex SHA-256 of the uploaded archive.
pub fn archive_digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn malformed(err: io::Error) -> DeployError {
    DeployError::MalformedArchive(err.to_string())
}

/// Map a failure to create `path` in the staging tree. The tree starts
/// empty, so a file/directory clash comes from the bundle itself.
fn placement(path: &str, err: io::Error) -> DeployError {
    match err.kind() {
        io::ErrorKind::AlreadyExists | io::ErrorKind::IsADirectory | io::ErrorKind::NotADirectory => {
            DeployError::MalformedArchive(format!("{path}: a file and a directory share this path"))
        }
        _ => DeployError::Io(err),
    }
}

/// Extract `bytes` into `dest`, which must be an empty directory.
///
/// On error `dest` may hold a partial tree; the caller discards it.
pub fn extract_bundle(bytes: &[u8], dest: &Path, limits: ExtractLimits) -> DeployResult<ExtractSummary> {
    let mut archive = Archive::new(GzDecoder::new(bytes));
    let mut summary = ExtractSummary::default();

    for entry in archive.entries().map_err(malformed)? {
        let mut entry = entry.map_err(malformed)?;
        let raw = entry.path().map_err(malformed)?.into_owned();
        let display = raw.display().to_string();
        let relative = normalize_relative(&raw)?;

        match entry.header().entry_type() {
            EntryType::Symlink | EntryType::Link => {
                return Err(DeployError::LinkEntry(display));
            }
            EntryType::Directory => {
                if !relative.as_os_str().is_empty() {
                    fs::create_dir_all(dest.join(&relative)).map_err(|e| placement(&display, e))?;
                }
            }
            EntryType::Regular | EntryType::Continuous => {
                if relative.as_os_str().is_empty() {
                    return Err(DeployError::UnsupportedEntry(display));
                }
                summary.file_count += 1;
                if summary.file_count > limits.max_files {
                    return Err(DeployError::TooManyFiles {
                        limit: limits.max_files,
                    });
                }
                let size = entry.header().size().map_err(malformed)?;
                summary.extracted_bytes = summary.extracted_bytes.saturating_add(size);
                if summary.extracted_bytes > limits.max_extracted_bytes {
                    return Err(DeployError::ExtractedTooLarge {
                        limit: limits.max_extracted_bytes,
                    });
                }

                let target = dest.join(&relative);
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).map_err(|e| placement(&display, e))?;
                }
                let mut file = File::create(&target).map_err(|e| placement(&display, e))?;
                // The entry reader stops at the header size.
                let mut limited = (&mut entry).take(size);
                io::copy(&mut limited, &mut file).map_err(|e| match e.kind() {
                    io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof => malformed(e),
                    _ => DeployError::Io(e),
                })?;
                debug!(path = %relative.display(), size, "extracted bundle file");
            }
            EntryType::XGlobalHeader | EntryType::XHeader => {}
            other => {
                return Err(DeployError::UnsupportedEntry(format!("{display} ({other:?})")));
            }
        }
    }

    if summary.file_count == 0 {
        return Err(DeployError::EmptyBundle);
    }
    Ok(summary)
}


#[cfg(test)]
mod tests {
    use super::testutil::{bundle, bundle_with_link};
    use super::*;

    fn limits() -> ExtractLimits {
        ExtractLimits {
            max_extracted_bytes: 1024 * 1024,
            max_files: 100,
        }
    }

    #[test]
    fn extracts_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        let archive = bundle(&[
            ("index.html", b"<h1>home</h1>"),
            ("assets/app.js", b"console.log(1)"),
            ("./docs/../about.html", b"about"),
        ]);
        let summary = extract_bundle(&archive, dir.path(), limits()).unwrap();

        assert_eq!(summary.file_count, 3);
        assert_eq!(
            fs::read_to_string(dir.path().join("assets/app.js")).unwrap(),
            "console.log(1)"
        );
        assert!(dir.path().join("about.html").is_file());
    }

    #[test]
    fn parent_escape_rejects_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let archive = bundle(&[("ok.txt", b"fine"), ("../escape.txt", b"owned")]);
        let err = extract_bundle(&archive, dir.path(), limits()).unwrap_err();
        assert!(matches!(err, DeployError::UnsafePath(_)));
        assert_eq!(err.status(), 400);
        assert!(!dir.path().parent().unwrap().join("escape.txt").exists());
    }

    #[test]
    fn absolute_path_rejects_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let archive = bundle(&[("/etc/nimbus-owned", b"x")]);
        let err = extract_bundle(&archive, dir.path(), limits()).unwrap_err();
        assert_eq!(err.status(), 400);
    }

    #[test]
    fn links_reject_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let archive = bundle_with_link("passwd", "index.html");
        let err = extract_bundle(&archive, dir.path(), limits()).unwrap_err();
        assert!(matches!(err, DeployError::LinkEntry(_)));
    }

    #[test]
    fn empty_bundle_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = extract_bundle(&bundle(&[]), dir.path(), limits()).unwrap_err();
        assert!(matches!(err, DeployError::EmptyBundle));
    }

    #[test]
    fn expansion_limits() {
        let dir = tempfile::tempdir().unwrap();
        let big = vec![b'a'; 4096];
        let tight = ExtractLimits {
            max_extracted_bytes: 1024,
            max_files: 100,
        };
        let err = extract_bundle(&bundle(&[("big.bin", &big)]), dir.path(), tight).unwrap_err();
        assert!(matches!(err, DeployError::ExtractedTooLarge { .. }));
        assert_eq!(err.status(), 413);

        let dir = tempfile::tempdir().unwrap();
        let few = ExtractLimits {
            max_extracted_bytes: 1024,
            max_files: 1,
        };
        let err = extract_bundle(&bundle(&[("a", b"1"), ("b", b"2")]), dir.path(), few).unwrap_err();
        assert!(matches!(err, DeployError::TooManyFiles { .. }));
    }

    #[test]
    fn file_and_directory_on_one_path_is_malformed() {
        for entries in [
            [("a/b", b"x".as_slice()), ("a", b"y".as_slice())],
            [("a", b"y".as_slice()), ("a/b", b"x".as_slice())],
            [("a", b"y".as_slice()), ("a/b/c", b"x".as_slice())],
        ] {
            let dir = tempfile::tempdir().unwrap();
            let err = extract_bundle(&bundle(&entries), dir.path(), limits()).unwrap_err();
            assert!(matches!(err, DeployError::MalformedArchive(_)), "{entries:?}: {err}");
            assert_eq!(err.status(), 400);
        }
    }

    #[test]
    fn garbage_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let err = extract_bundle(b"definitely not gzip", dir.path(), limits()).unwrap_err();
        assert_eq!(err.status(), 400);
    }

    #[test]
    fn digest_is_hex_sha256() {
        assert_eq!(
            archive_digest(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
