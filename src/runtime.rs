//! Container runtime adapter
//!
//! Volume-backed storage can only be reached from inside the container
//! runtime, so volume snapshots and restores run as short-lived helper
//! containers. The engine talks to the runtime through [`ContainerRuntime`];
//! [`CliRuntime`] implements it on top of the `docker` (or `podman`) CLI.
//!
//! Helpers are started detached and without `--rm`, so the engine can wait
//! for the exit code and read logs after the fact. The engine removes them
//! once it has observed the exit.

use crate::error::{Result, SnapshotError};
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use tracing::{debug, info, warn};

/// A job for a helper container
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelperTask {
    /// Archive `volume` into `destination_dir/data.tar[.gz]`
    Archive {
        /// Source volume
        volume: String,
        /// Host directory receiving the archive
        destination_dir: PathBuf,
        /// Write `data.tar.gz` instead of `data.tar`
        compress: bool,
    },
    /// Delete everything inside `volume`
    Empty {
        /// Volume to empty
        volume: String,
    },
    /// Extract a host archive into `volume`
    Extract {
        /// Destination volume
        volume: String,
        /// Host archive file
        archive: PathBuf,
        /// Whether the archive is gzip-compressed
        compressed: bool,
    },
    /// Copy a directory-form snapshot into `volume`
    CopyTree {
        /// Destination volume
        volume: String,
        /// Host directory holding the copied tree
        source_dir: PathBuf,
    },
}

impl HelperTask {
    /// Stage label used in logs and errors
    pub fn stage(&self) -> &'static str {
        match self {
            HelperTask::Archive { .. } => "snapshot.volume.export",
            HelperTask::Empty { .. } => "restore.volume.empty",
            HelperTask::Extract { .. } | HelperTask::CopyTree { .. } => "restore.volume.extract",
        }
    }

    /// Volume this task operates on
    pub fn volume(&self) -> &str {
        match self {
            HelperTask::Archive { volume, .. }
            | HelperTask::Empty { volume }
            | HelperTask::Extract { volume, .. }
            | HelperTask::CopyTree { volume, .. } => volume,
        }
    }
}

/// Operations the engine needs from the container runtime
pub trait ContainerRuntime: Send + Sync {
    /// Start a detached helper container, returning its id
    fn spawn_helper(&self, task: &HelperTask) -> Result<String>;

    /// Follow a container's output until it exits
    fn stream_logs(&self, id: &str, on_line: &(dyn Fn(&str) + Sync)) -> Result<()>;

    /// Block until the container exits and return its exit code
    fn wait(&self, id: &str) -> Result<i32>;

    /// Whether the container is still running; unknown ids are not running
    fn is_running(&self, id: &str) -> Result<bool>;

    /// Kill a running container
    fn kill(&self, id: &str) -> Result<()>;

    /// Remove a container
    fn remove(&self, id: &str) -> Result<()>;

    /// Bytes currently used inside `volume`
    fn volume_usage(&self, volume: &str) -> Result<u64>;
}

const ARCHIVE_COMPRESSED: &str = "apk add --no-cache pigz >/dev/null 2>&1; \
if command -v pigz >/dev/null 2>&1; then c=pigz; else c=gzip; fi; \
set -o pipefail; tar cvf - -C /source . | $c > /backup/data.tar.gz";

const ARCHIVE_PLAIN: &str = "tar cvf /backup/data.tar -C /source .";

const EMPTY: &str = "find /target -mindepth 1 -delete";

const EXTRACT_COMPRESSED: &str = "set -o pipefail; \
if command -v pigz >/dev/null 2>&1; then pigz -dc \"/backup/$1\"; else gunzip -c \"/backup/$1\"; fi \
| tar xpvf - --no-same-owner -C /target";

const EXTRACT_PLAIN: &str = "tar xpvf \"/backup/$1\" --no-same-owner -C /target";

const COPY_TREE: &str = "cp -a /backup/. /target/ && rm -f /target/.in-progress /target/.complete /target/.bind-active";

/// [`ContainerRuntime`] driving the docker/podman command line
#[derive(Debug, Clone)]
pub struct CliRuntime {
    exe: String,
    image: String,
}

impl CliRuntime {
    /// Runtime calling `exe` and running helpers from `image`
    pub fn new(exe: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            exe: exe.into(),
            image: image.into(),
        }
    }

    /// `docker` if installed, else `podman`
    pub fn detect(image: impl Into<String>) -> Result<Self> {
        let exe = ["docker", "podman"]
            .into_iter()
            .find(|exe| which::which(exe).is_ok())
            .ok_or_else(|| SnapshotError::runtime("neither docker nor podman is installed"))?;
        Ok(Self::new(exe, image))
    }

    /// Runtime executable
    pub fn exe(&self) -> &str {
        &self.exe
    }

    /// Arguments of the `run` invocation for `task`
    pub fn run_args(&self, task: &HelperTask) -> Result<Vec<String>> {
        let mut args = vec!["run".to_string(), "-d".to_string()];
        let (script, positional): (&str, Option<String>) = match task {
            HelperTask::Archive {
                volume,
                destination_dir,
                compress,
            } => {
                args.extend(mount(volume, "/source", true));
                args.extend(mount(&path_str(destination_dir)?, "/backup", false));
                (if *compress { ARCHIVE_COMPRESSED } else { ARCHIVE_PLAIN }, None)
            }
            HelperTask::Empty { volume } => {
                args.extend(mount(volume, "/target", false));
                (EMPTY, None)
            }
            HelperTask::Extract {
                volume,
                archive,
                compressed,
            } => {
                let (dir, file) = split_file(archive)?;
                args.extend(mount(volume, "/target", false));
                args.extend(mount(&dir, "/backup", true));
                (
                    if *compressed { EXTRACT_COMPRESSED } else { EXTRACT_PLAIN },
                    Some(file),
                )
            }
            HelperTask::CopyTree { volume, source_dir } => {
                args.extend(mount(volume, "/target", false));
                args.extend(mount(&path_str(source_dir)?, "/backup", true));
                (COPY_TREE, None)
            }
        };
        args.extend([self.image.clone(), "sh".into(), "-c".into(), script.into(), "sh".into()]);
        args.extend(positional);
        Ok(args)
    }

    fn run_cli(&self, args: &[&str]) -> Result<String> {
        debug!("{} {}", self.exe, args.join(" "));
        let output = Command::new(&self.exe)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| SnapshotError::runtime(format!("failed to exec {}: {}", self.exe, e)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(SnapshotError::runtime(format!(
                "{} {} failed: {}",
                self.exe,
                args.first().unwrap_or(&""),
                stderr.trim()
            )))
        }
    }
}

fn mount(source: &str, target: &str, read_only: bool) -> [String; 2] {
    let suffix = if read_only { ":ro" } else { "" };
    ["-v".to_string(), format!("{}:{}{}", source, target, suffix)]
}

fn path_str(path: &Path) -> Result<String> {
    path.to_str()
        .map(str::to_string)
        .ok_or_else(|| SnapshotError::runtime(format!("path is not valid UTF-8: {:?}", path)))
}

fn split_file(path: &Path) -> Result<(String, String)> {
    let dir = path
        .parent()
        .ok_or_else(|| SnapshotError::runtime(format!("archive has no parent directory: {:?}", path)))?;
    let file = path
        .file_name()
        .and_then(|f| f.to_str())
        .ok_or_else(|| SnapshotError::runtime(format!("archive has no file name: {:?}", path)))?;
    Ok((path_str(dir)?, file.to_string()))
}

fn forward_lines<R: Read>(source: R, on_line: &(dyn Fn(&str) + Sync)) {
    let mut reader = BufReader::new(source);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) | Err(_) => break,
            Ok(_) => on_line(String::from_utf8_lossy(&buf).trim_end()),
        }
    }
}

impl ContainerRuntime for CliRuntime {
    fn spawn_helper(&self, task: &HelperTask) -> Result<String> {
        let args = self.run_args(task)?;
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let id = self.run_cli(&args)?;
        if id.is_empty() {
            return Err(SnapshotError::runtime("runtime returned an empty container id"));
        }
        info!(stage = task.stage(), volume = task.volume(), "Started helper container {}", id);
        Ok(id)
    }

    fn stream_logs(&self, id: &str, on_line: &(dyn Fn(&str) + Sync)) -> Result<()> {
        let mut child = Command::new(&self.exe)
            .args(["logs", "-f", id])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SnapshotError::runtime(format!("failed to exec {}: {}", self.exe, e)))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        thread::scope(|scope| {
            if let Some(err) = stderr {
                scope.spawn(move || forward_lines(err, on_line));
            }
            if let Some(out) = stdout {
                forward_lines(out, on_line);
            }
        });
        child.wait()?;
        Ok(())
    }

    fn wait(&self, id: &str) -> Result<i32> {
        let out = self.run_cli(&["wait", id])?;
        out.lines()
            .last()
            .and_then(|l| l.trim().parse().ok())
            .ok_or_else(|| SnapshotError::runtime(format!("unexpected wait output for {}: {:?}", id, out)))
    }

    fn is_running(&self, id: &str) -> Result<bool> {
        match self.run_cli(&["inspect", "-f", "{{.State.Running}}", id]) {
            Ok(out) => Ok(out == "true"),
            Err(e) => {
                debug!("inspect {} failed, treating as not running: {}", id, e);
                Ok(false)
            }
        }
    }

    fn kill(&self, id: &str) -> Result<()> {
        info!("Killing helper container {}", id);
        self.run_cli(&["kill", id]).map(|_| ())
    }

    fn remove(&self, id: &str) -> Result<()> {
        if let Err(e) = self.run_cli(&["rm", "-f", id]) {
            warn!("Failed to remove helper container {}: {}", id, e);
            return Err(e);
        }
        Ok(())
    }

    fn volume_usage(&self, volume: &str) -> Result<u64> {
        let volume_mount = format!("{}:/t:ro", volume);
        let out = self.run_cli(&[
            "run",
            "--rm",
            "-v",
            &volume_mount,
            &self.image,
            "sh",
            "-c",
            "du -sk /t 2>/dev/null | cut -f1",
        ])?;
        Ok(out.trim().parse::<u64>().unwrap_or(0) * 1024)
    }
}
