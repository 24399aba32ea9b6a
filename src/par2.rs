//! PAR2 invoker (C9, §4.9): subprocess orchestration around the external
//! `par2` tool to produce a redundancy set alongside a job's files.

use crate::config::Par2Config;
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Invokes the external `par2` binary to create redundancy volumes.
///
/// The tool's absence is a configuration error surfaced at invocation time;
/// this invoker does not fetch or execute a network-sourced binary on the
/// caller's behalf (see `DESIGN.md` for why the source system's
/// best-effort auto-download is not reproduced here).
pub struct Par2Invoker {
    binary_path: PathBuf,
}

impl Par2Invoker {
    /// Construct an invoker for an explicit binary path.
    pub fn new(binary_path: PathBuf) -> Self {
        Self { binary_path }
    }

    /// Discover `par2` on `PATH`.
    pub fn from_path() -> Option<Self> {
        which::which("par2").ok().map(Self::new)
    }

    /// Create a redundancy set for `input_files`, writing volumes into
    /// `cfg.temp_dir` (or the first input file's directory if unset).
    /// Returns the generated `.par2` file paths, sorted, ready to be posted
    /// as `PartType::Par2` articles.
    pub async fn create_redundancy_set(
        &self,
        input_files: &[PathBuf],
        cfg: &Par2Config,
    ) -> Result<Vec<PathBuf>> {
        let Some(first) = input_files.first() else {
            return Err(Error::ExternalTool(
                "par2 redundancy set requires at least one input file".to_string(),
            ));
        };

        let work_dir = cfg
            .temp_dir
            .clone()
            .or_else(|| first.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."));

        let basename = first
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("volume");
        let par2_set_path = work_dir.join(format!("{basename}.par2"));

        let mut cmd = Command::new(&self.binary_path);
        cmd.arg("c").arg(format!("-r{}", cfg.redundancy));
        if cfg.volume_size > 0 {
            cmd.arg(format!("-s{}", cfg.volume_size));
        }
        cmd.arg(format!("-t{}", cfg.max_input_slices));
        for extra in &cfg.extra_par2_options {
            cmd.arg(extra);
        }
        cmd.arg(&par2_set_path);
        for input in input_files {
            cmd.arg(input);
        }
        cmd.current_dir(&work_dir);

        let output = cmd
            .output()
            .await
            .map_err(|e| Error::ExternalTool(format!("failed to execute par2: {e}")))?;

        if !output.status.success() {
            return Err(Error::ExternalTool(format!(
                "par2 create failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        collect_par2_set(&work_dir, basename)
    }
}

/// Scans `dir` for the `.par2` index and `.volNNN+NNN.par2` volumes
/// belonging to `basename`, matching how `par2 create` names its output.
fn collect_par2_set(dir: &Path, basename: &str) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let entries = std::fs::read_dir(dir).map_err(Error::Io)?;
    for entry in entries {
        let entry = entry.map_err(Error::Io)?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with(basename) && name.ends_with(".par2") {
            found.push(entry.path());
        }
    }
    found.sort();
    Ok(found)
}
