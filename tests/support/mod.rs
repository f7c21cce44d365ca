//! Shared fixtures: an in-memory container runtime and an engine harness

use ::coldsnap::*;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// How the next helper containers behave
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelperMode {
    /// Do the work and exit 0
    Succeed,
    /// Print `lines` and exit with `code`
    Fail { code: i32, lines: Vec<String> },
    /// Write a partial artifact, then run until killed
    Hang,
}

#[derive(Debug)]
struct FakeContainer {
    running: bool,
    exit_code: i32,
    logs: Vec<String>,
}

/// [`ContainerRuntime`] keeping volumes as byte buffers
pub struct FakeRuntime {
    mode: Mutex<HelperMode>,
    containers: Mutex<HashMap<String, FakeContainer>>,
    exited: Condvar,
    volumes: Mutex<HashMap<String, Vec<u8>>>,
    tasks: Mutex<Vec<HelperTask>>,
    removed: Mutex<Vec<String>>,
    next_id: AtomicU64,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            mode: Mutex::new(HelperMode::Succeed),
            containers: Mutex::new(HashMap::new()),
            exited: Condvar::new(),
            volumes: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn set_mode(&self, mode: HelperMode) {
        *self.mode.lock() = mode;
    }

    pub fn set_volume(&self, name: &str, content: &[u8]) {
        self.volumes.lock().insert(name.to_string(), content.to_vec());
    }

    pub fn volume(&self, name: &str) -> Option<Vec<u8>> {
        self.volumes.lock().get(name).cloned()
    }

    pub fn tasks(&self) -> Vec<HelperTask> {
        self.tasks.lock().clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().clone()
    }

    pub fn running_count(&self) -> usize {
        self.containers.lock().values().filter(|c| c.running).count()
    }

    /// Register a running container that nothing will ever stop
    pub fn start_orphan(&self, id: &str) {
        self.containers.lock().insert(
            id.to_string(),
            FakeContainer {
                running: true,
                exit_code: 0,
                logs: Vec::new(),
            },
        );
    }

    fn perform(&self, task: &HelperTask) -> std::io::Result<()> {
        match task {
            HelperTask::Archive {
                volume,
                destination_dir,
                compress,
            } => {
                let name = if *compress { "data.tar.gz" } else { "data.tar" };
                let content = self.volume(volume).unwrap_or_default();
                fs::write(destination_dir.join(name), content)
            }
            HelperTask::Empty { volume } => {
                self.volumes.lock().insert(volume.clone(), Vec::new());
                Ok(())
            }
            HelperTask::Extract { volume, archive, .. } => {
                let content = fs::read(archive)?;
                self.volumes.lock().insert(volume.clone(), content);
                Ok(())
            }
            HelperTask::CopyTree { volume, source_dir } => {
                let mut content = Vec::new();
                let mut names: Vec<PathBuf> = fs::read_dir(source_dir)?
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| p.is_file() && !p.file_name().is_some_and(|n| n.to_string_lossy().starts_with('.')))
                    .collect();
                names.sort();
                for name in names {
                    content.extend(fs::read(name)?);
                }
                self.volumes.lock().insert(volume.clone(), content);
                Ok(())
            }
        }
    }
}

impl ContainerRuntime for FakeRuntime {
    fn spawn_helper(&self, task: &HelperTask) -> Result<String> {
        self.tasks.lock().push(task.clone());
        let id = format!("fake-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let mode = self.mode.lock().clone();

        let container = match mode {
            HelperMode::Succeed => match self.perform(task) {
                Ok(()) => FakeContainer {
                    running: false,
                    exit_code: 0,
                    logs: vec![format!("{} done", task.stage())],
                },
                Err(e) => FakeContainer {
                    running: false,
                    exit_code: 1,
                    logs: vec![e.to_string()],
                },
            },
            HelperMode::Fail { code, lines } => FakeContainer {
                running: false,
                exit_code: code,
                logs: lines,
            },
            HelperMode::Hang => {
                if let HelperTask::Archive {
                    destination_dir,
                    compress,
                    ..
                } = task
                {
                    let name = if *compress { "data.tar.gz" } else { "data.tar" };
                    let _ = fs::write(destination_dir.join(name), b"partial");
                }
                FakeContainer {
                    running: true,
                    exit_code: 0,
                    logs: vec!["./disk.img".to_string()],
                }
            }
        };
        self.containers.lock().insert(id.clone(), container);
        Ok(id)
    }

    fn stream_logs(&self, id: &str, on_line: &(dyn Fn(&str) + Sync)) -> Result<()> {
        let logs = self
            .containers
            .lock()
            .get(id)
            .map(|c| c.logs.clone())
            .ok_or_else(|| SnapshotError::runtime(format!("no such container: {}", id)))?;
        for line in &logs {
            on_line(line);
        }
        Ok(())
    }

    fn wait(&self, id: &str) -> Result<i32> {
        let mut containers = self.containers.lock();
        loop {
            match containers.get(id) {
                None => return Err(SnapshotError::runtime(format!("no such container: {}", id))),
                Some(c) if !c.running => return Ok(c.exit_code),
                Some(_) => self.exited.wait(&mut containers),
            }
        }
    }

    fn is_running(&self, id: &str) -> Result<bool> {
        Ok(self.containers.lock().get(id).is_some_and(|c| c.running))
    }

    fn kill(&self, id: &str) -> Result<()> {
        if let Some(c) = self.containers.lock().get_mut(id) {
            if c.running {
                c.running = false;
                c.exit_code = 137;
            }
        }
        self.exited.notify_all();
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<()> {
        let mut containers = self.containers.lock();
        if let Some(c) = containers.get_mut(id) {
            c.running = false;
        }
        self.removed.lock().push(id.to_string());
        self.exited.notify_all();
        Ok(())
    }

    fn volume_usage(&self, volume: &str) -> Result<u64> {
        Ok(self.volume(volume).map(|v| v.len() as u64).unwrap_or(0))
    }
}

/// An engine over a temporary snapshot root with fast timers
pub struct Harness {
    pub temp_dir: TempDir,
    pub root: PathBuf,
    pub runtime: Arc<FakeRuntime>,
    pub store: Arc<MemoryConfigStore>,
    pub engine: Arc<SnapshotEngine>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(|_| {})
    }

    pub fn with_settings(f: impl FnOnce(&mut SnapshotSettings)) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("snapshots");
        let mut settings = SnapshotSettings::with_root(&root);
        f(&mut settings);

        let runtime = FakeRuntime::new();
        let store = Arc::new(MemoryConfigStore::new(settings));
        let engine = EngineBuilder::new(store.clone())
            .runtime(runtime.clone())
            .sample_interval(Duration::from_millis(20))
            .heartbeat_interval(Duration::from_millis(50))
            .restore_poll_interval(Duration::from_millis(20))
            .reconcile_interval(Duration::from_millis(30))
            .kill_grace(Duration::from_millis(300))
            .build()
            .unwrap();

        Self {
            temp_dir,
            root,
            runtime,
            store,
            engine: Arc::new(engine),
        }
    }

    /// Path under the temporary directory, outside the snapshot root
    pub fn path(&self, rel: &str) -> PathBuf {
        self.temp_dir.path().join(rel)
    }

    pub fn settings(&self) -> SnapshotSettings {
        self.engine.config().read().unwrap()
    }

    /// Create a volume snapshot with a fixed id
    pub fn snapshot_volume(&self, id: &str) -> Snapshot {
        let (_, name) = utils::parse_snapshot_id(id).unwrap();
        self.engine
            .create_snapshot(
                &name,
                &StorageDescriptor::volume("vm-data"),
                None,
                &CancellationToken::new(),
                Some(id),
            )
            .unwrap()
    }

    /// Lay out a snapshot directory by hand
    pub fn plant(&self, id: &str, artifact: &[u8], markers_present: &[&str]) -> PathBuf {
        let dir = self.root.join(id);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("data.tar.gz"), artifact).unwrap();
        for marker in markers_present {
            markers::touch(&dir, marker).unwrap();
        }
        dir
    }

    pub fn ids(&self) -> Vec<String> {
        self.engine.list_snapshots().unwrap().into_iter().map(|s| s.id).collect()
    }
}

/// Poll `cond` until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

/// Write `(relative path, content)` pairs under `dir`
pub fn populate(dir: &Path, files: &[(&str, &[u8])]) {
    for (rel, content) in files {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }
}

/// Every regular file under `dir`, relative path to content
pub fn snapshot_tree(dir: &Path) -> Vec<(PathBuf, Vec<u8>)> {
    let mut files: Vec<(PathBuf, Vec<u8>)> = walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let rel = e.path().strip_prefix(dir).unwrap().to_path_buf();
            (rel, fs::read(e.path()).unwrap())
        })
        .collect();
    files.sort();
    files
}

/// Pid of a process that has already exited
pub fn dead_pid() -> u32 {
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    pid
}

pub fn has_bash() -> bool {
    which::which("bash").is_ok()
}
