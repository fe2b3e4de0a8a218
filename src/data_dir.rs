use std::path::{Path, PathBuf};

/// Manages the `.foreman/` directory layout.
///
/// All foreman state lives under a single data directory (default
/// `.foreman/`): the integration workspace, one workspace per worker, lock
/// markers, and the STOP file. This struct provides accessors for each
/// well-known path and handles initialization.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Create a new DataDir referencing the given root path.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory (e.g. `.foreman/`).
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to the integration workspace repository.
    pub fn integration_dir(&self) -> PathBuf {
        self.root.join("integration")
    }

    /// Path to the directory holding one workspace per worker.
    pub fn workers_dir(&self) -> PathBuf {
        self.root.join("workers")
    }

    /// Path to a specific worker's workspace (e.g. `workers/worker-1`).
    pub fn worker_dir(&self, worker_id: &str) -> PathBuf {
        self.workers_dir().join(worker_id)
    }

    /// Path to the directory holding lock marker files.
    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    /// Path to the STOP file that asks running loops to wind down.
    pub fn stop_file(&self) -> PathBuf {
        self.root.join("STOP")
    }

    /// Initialize the directory structure: root, workers/, and locks/.
    /// The integration workspace itself is provisioned separately, as a
    /// git repository. Returns Ok(true) if the root was created, Ok(false)
    /// if it already existed.
    pub fn init(&self) -> std::io::Result<bool> {
        let created = !self.root.exists();
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.workers_dir())?;
        std::fs::create_dir_all(self.locks_dir())?;
        Ok(created)
    }

    /// Ensure the data directory exists, creating it if missing, and add
    /// it to a host project's .gitignore when one is present.
    pub fn ensure_initialized(&self) -> std::io::Result<()> {
        self.init()?;
        self.update_gitignore()?;
        Ok(())
    }

    /// Append the data directory path to .gitignore if:
    /// 1. A .gitignore file exists in the parent of the data dir
    /// 2. It doesn't already contain the entry
    fn update_gitignore(&self) -> std::io::Result<()> {
        let gitignore_dir = self.root.parent().unwrap_or_else(|| Path::new("."));
        let gitignore_path = gitignore_dir.join(".gitignore");

        let dir_name = self
            .root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.root.to_string_lossy().to_string());
        let entry = format!("{dir_name}/");

        if gitignore_path.exists() {
            let contents = std::fs::read_to_string(&gitignore_path)?;
            let already_present = contents.lines().any(|line| {
                let trimmed = line.trim();
                trimmed == entry || trimmed == dir_name
            });
            if !already_present {
                let prefix = if contents.ends_with('\n') || contents.is_empty() {
                    ""
                } else {
                    "\n"
                };
                let mut file = std::fs::OpenOptions::new()
                    .append(true)
                    .open(&gitignore_path)?;
                use std::io::Write;
                writeln!(file, "{prefix}{entry}")?;
            }
        }
        // If no .gitignore exists, don't create one
        Ok(())
    }
}
