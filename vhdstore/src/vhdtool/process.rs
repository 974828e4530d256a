use std::path::{Path, PathBuf};
use std::process::Command;

use vhdstore_shared::{VhdStoreError, VhdStoreResult};

use super::{SnapshotOutcome, MAX_SIZE_MIB, MEBIBYTE};

/// Invokes the external `vhd-util` binary: one `Command` per call, stdio
/// captured, a non-zero exit turned into a typed error carrying stderr.
#[derive(Debug, Clone)]
pub struct ProcessVhdTool {
    binary_path: PathBuf,
}

impl Default for ProcessVhdTool {
    fn default() -> Self {
        Self::new("/usr/bin/vhd-util")
    }
}

impl ProcessVhdTool {
    pub fn new(binary_path: impl Into<PathBuf>) -> Self {
        Self {
            binary_path: binary_path.into(),
        }
    }

    fn run(&self, args: &[&str]) -> VhdStoreResult<Vec<u8>> {
        tracing::debug!(binary = %self.binary_path.display(), ?args, "running vhd-util");

        let output = Command::new(&self.binary_path)
            .args(args)
            .output()
            .map_err(|e| {
                VhdStoreError::ToolFailure {
                    exit_code: None,
                    stderr: format!("failed to spawn {}: {e}", self.binary_path.display()),
                }
            })?;

        if !output.status.success() {
            return Err(VhdStoreError::ToolFailure {
                exit_code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        Ok(output.stdout)
    }

    fn run_str(&self, args: &[&str]) -> VhdStoreResult<String> {
        let stdout = self.run(args)?;
        Ok(String::from_utf8_lossy(&stdout).trim().to_string())
    }
}

fn count_set_bits(bitmap: &[u8]) -> u32 {
    bitmap.iter().map(|b| b.count_ones()).sum()
}

/// `parent_path[-12:] == path[-12:]` in the original — compares the last
/// 12 characters of two VHD paths (enough to disambiguate ids without
/// caring about absolute-vs-relative path prefixes the tool may report).
fn paths_match_suffix(a: &str, b: &str) -> bool {
    fn tail(s: &str) -> &str {
        let len = s.len();
        &s[len.saturating_sub(12)..]
    }
    tail(a) == tail(b)
}

impl super::VhdTool for ProcessVhdTool {
    fn create(&self, path: &Path, size_mib: u64) -> VhdStoreResult<()> {
        self.run(&[
            "create",
            "-n",
            &path.display().to_string(),
            "-s",
            &size_mib.to_string(),
            "-S",
            &MAX_SIZE_MIB.to_string(),
        ])?;
        Ok(())
    }

    fn snapshot(
        &self,
        new_path: &Path,
        parent_path: &Path,
        force_link: bool,
    ) -> VhdStoreResult<SnapshotOutcome> {
        let new_path_s = new_path.display().to_string();
        let parent_path_s = parent_path.display().to_string();
        let max_size = MAX_SIZE_MIB.to_string();
        let mut args = vec![
            "snapshot",
            "-n",
            new_path_s.as_str(),
            "-p",
            parent_path_s.as_str(),
            "-S",
            max_size.as_str(),
        ];
        if force_link {
            args.push("-e");
        }
        self.run(&args)?;

        let observed_parent = self.get_parent(new_path)?;
        if paths_match_suffix(&observed_parent, &parent_path_s) {
            Ok(SnapshotOutcome::LinkedToSource)
        } else {
            Ok(SnapshotOutcome::LinkedToSourceParent)
        }
    }

    fn coalesce(&self, path: &Path) -> VhdStoreResult<()> {
        self.run(&["coalesce", "-n", &path.display().to_string()])?;
        Ok(())
    }

    fn get_parent(&self, path: &Path) -> VhdStoreResult<String> {
        self.run_str(&["query", "-n", &path.display().to_string(), "-p"])
    }

    fn set_parent(&self, path: &Path, parent_path: &Path) -> VhdStoreResult<()> {
        self.run(&[
            "modify",
            "-n",
            &path.display().to_string(),
            "-p",
            &parent_path.display().to_string(),
        ])?;
        Ok(())
    }

    fn resize(&self, path: &Path, size_mib: u64) -> VhdStoreResult<()> {
        self.run(&[
            "resize",
            "-n",
            &path.display().to_string(),
            "-s",
            &size_mib.to_string(),
            "-f",
        ])?;
        Ok(())
    }

    fn reset(&self, path: &Path) -> VhdStoreResult<()> {
        self.run(&["modify", "--debug", "-z", "-n", &path.display().to_string()])?;
        Ok(())
    }

    fn is_empty(&self, path: &Path) -> VhdStoreResult<bool> {
        let bitmap = self.run(&["read", "--debug", "-B", "-n", &path.display().to_string()])?;
        Ok(count_set_bits(&bitmap) == 0)
    }

    fn get_vsize(&self, path: &Path) -> VhdStoreResult<u64> {
        let out = self.run_str(&["query", "-n", &path.display().to_string(), "-v"])?;
        let mib: u64 = out.parse().map_err(|_| VhdStoreError::ToolFailure {
            exit_code: None,
            stderr: format!("unparseable vsize output: {out:?}"),
        })?;
        Ok(mib * MEBIBYTE)
    }

    fn get_psize(&self, path: &Path) -> VhdStoreResult<u64> {
        let out = self.run_str(&["query", "-n", &path.display().to_string(), "-s"])?;
        out.parse().map_err(|_| VhdStoreError::ToolFailure {
            exit_code: None,
            stderr: format!("unparseable psize output: {out:?}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_set_bits_counts_across_bytes() {
        assert_eq!(count_set_bits(&[0x00, 0x00]), 0);
        assert_eq!(count_set_bits(&[0xFF, 0x01]), 9);
    }

    #[test]
    fn paths_match_suffix_compares_last_12_chars() {
        assert!(paths_match_suffix("/srs/sr0/1.vhd", "/other/1.vhd"));
        assert!(!paths_match_suffix("/srs/sr0/1.vhd", "/srs/sr0/2.vhd"));
    }
}
