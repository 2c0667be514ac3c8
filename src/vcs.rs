use crate::config::ReadOptions;
use crate::error::ExtractorError;
use crate::repository::Repository;
use crate::util::CommandExtension as _;
use anyhow::Result;
use std::path::Path;
use std::process::Command;

/// Everything the core needs to know about an external version-control
/// system: how to recognize its working directories and how to pull a
/// fast-import stream out of it. Extraction runs the exporter subprocess to
/// completion and parses its captured output; there is no concurrency and
/// no cancellation once the subprocess starts.
#[derive(Debug, Clone)]
pub struct VcsDescriptor {
    pub name: &'static str,
    /// Directory whose presence marks a working copy root.
    pub subdirectory: &'static str,
    /// Exporter argv producing a fast-import stream on stdout, or empty if
    /// the system cannot export.
    pub exporter: &'static [&'static str],
    /// Importer argv consuming a fast-import stream on stdin, or empty.
    pub importer: &'static [&'static str],
    /// Per-directory ignore file name, if the system has one.
    pub ignore_file: &'static str,
}

/// The descriptor table. Order matters: detection takes the first match.
pub const VCS_TABLE: &[VcsDescriptor] = &[
    VcsDescriptor {
        name: "git",
        subdirectory: ".git",
        exporter: &["git", "fast-export", "--all", "--use-done-feature"],
        importer: &["git", "fast-import", "--quiet"],
        ignore_file: ".gitignore",
    },
    VcsDescriptor {
        name: "hg",
        subdirectory: ".hg",
        exporter: &["hg-fast-export.sh", "-s"],
        importer: &[],
        ignore_file: ".hgignore",
    },
    VcsDescriptor {
        name: "bzr",
        subdirectory: ".bzr",
        exporter: &["bzr", "fast-export", "--no-plain", "."],
        importer: &["bzr", "fast-import", "-"],
        ignore_file: ".bzrignore",
    },
    VcsDescriptor {
        name: "svn",
        subdirectory: ".svn",
        exporter: &[],
        importer: &[],
        ignore_file: "",
    },
];

pub fn find_vcs(name: &str) -> Option<&'static VcsDescriptor> {
    VCS_TABLE.iter().find(|vcs| vcs.name == name)
}

/// Identifies the VCS owning `dir` by its marker subdirectory.
pub fn detect_vcs(dir: &Path) -> Option<&'static VcsDescriptor> {
    VCS_TABLE
        .iter()
        .filter(|vcs| !vcs.subdirectory.is_empty())
        .find(|vcs| dir.join(vcs.subdirectory).is_dir())
}

/// Runs the descriptor's exporter in `dir` and parses the resulting stream.
/// Subprocess misbehavior is an extractor error; no partial repository is
/// returned and the scratch directory of the partial parse is released on
/// the failure path.
pub fn extract(
    vcs: &VcsDescriptor,
    dir: &Path,
    name: &str,
    options: &ReadOptions,
) -> Result<Repository> {
    if vcs.exporter.is_empty() {
        return Err(ExtractorError::new(
            vcs.name,
            "this system has no stream exporter",
        )
        .into());
    }
    let output = Command::new(vcs.exporter[0])
        .args(&vcs.exporter[1..])
        .current_dir(dir)
        .safe_output()
        .map_err(|e| ExtractorError::new(vcs.exporter[0], e.to_string()))?;
    if !output.status.success() {
        return Err(ExtractorError::new(
            vcs.exporter[0],
            format!(
                "{}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim_end()
            ),
        )
        .into());
    }
    let mut repo = crate::importer::read_auto_bytes(&output.stdout, name, options)
        .map_err(|e| anyhow::Error::from(ExtractorError::new(vcs.exporter[0], e.to_string())))?;
    repo.sourcetype = Some(vcs.name.to_owned());
    Ok(repo)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_lookup() {
        assert_eq!(find_vcs("git").unwrap().subdirectory, ".git");
        assert!(find_vcs("tla").is_none());
    }

    #[test]
    fn test_detect_vcs() {
        let dir = tempfile::tempdir().unwrap();
        assert!(detect_vcs(dir.path()).is_none());
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        assert_eq!(detect_vcs(dir.path()).unwrap().name, "git");
    }

    #[test]
    fn test_extract_without_exporter_is_extractor_error() {
        let svn = find_vcs("svn").unwrap();
        let dir = tempfile::tempdir().unwrap();
        let err = extract(svn, dir.path(), "test", &ReadOptions::default()).unwrap_err();
        assert!(err.downcast_ref::<ExtractorError>().is_some());
    }

    #[test]
    fn test_extract_missing_binary_is_extractor_error() {
        let fake = VcsDescriptor {
            name: "fake",
            subdirectory: ".fake",
            exporter: &["definitely-not-a-real-binary-xyzzy"],
            importer: &[],
            ignore_file: "",
        };
        let dir = tempfile::tempdir().unwrap();
        let err = extract(&fake, dir.path(), "test", &ReadOptions::default()).unwrap_err();
        assert!(err.downcast_ref::<ExtractorError>().is_some());
    }
}
