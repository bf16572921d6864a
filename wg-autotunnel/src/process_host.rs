// Foreground marker for running tunnels
//!
//! While at least one tunnel is running the daemon keeps a state file in its
//! run directory so external tools (status bars, `systemctl status` helpers)
//! can tell a tunnel is active. Start/stop calls are reference counted, so
//! every tunnel controller can call them independently.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

const STATE_FILE_NAME: &str = "state";

/// Host process keeping the daemon marked as busy while tunnels run
pub trait ProcessHost: Send + Sync {
    /// Take one foreground reference
    fn start_foreground(&self);

    /// Release one foreground reference
    fn stop_foreground(&self);

    /// Number of references currently held
    fn foreground_count(&self) -> usize;
}

/// Reference-counted host writing `<run_dir>/state`
pub struct StateFileHost {
    state_file: Option<PathBuf>,
    count: Mutex<usize>,
}

impl StateFileHost {
    pub fn new(run_dir: &Path) -> Self {
        Self {
            state_file: Some(run_dir.join(STATE_FILE_NAME)),
            count: Mutex::new(0),
        }
    }

    /// Host that only counts references
    pub fn detached() -> Self {
        Self {
            state_file: None,
            count: Mutex::new(0),
        }
    }

    fn write(&self, count: usize) {
        let Some(path) = &self.state_file else {
            return;
        };
        let result = if count == 0 {
            remove_state(path)
        } else {
            write_state(path, count)
        };
        if let Err(e) = result {
            log::warn!("Failed to update state file: {:#}", e);
        }
    }
}

impl ProcessHost for StateFileHost {
    fn start_foreground(&self) {
        let mut count = self.count.lock();
        *count += 1;
        if *count == 1 {
            log::info!("Entering foreground: a tunnel is active");
        }
        self.write(*count);
    }

    fn stop_foreground(&self) {
        let mut count = self.count.lock();
        if *count == 0 {
            return;
        }
        *count -= 1;
        if *count == 0 {
            log::info!("Leaving foreground: no tunnel is active");
        }
        self.write(*count);
    }

    fn foreground_count(&self) -> usize {
        *self.count.lock()
    }
}

/// Write current state to state file
fn write_state(path: &Path, active: usize) -> Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.exists() {
            fs::create_dir_all(dir).context("Failed to create state directory")?;
        }
    }

    let timestamp = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let content = format!("STATE=active\nACTIVE={}\nTIMESTAMP={}\n", active, timestamp);
    fs::write(path, content).context("Failed to write state file")?;
    Ok(())
}

fn remove_state(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).context("Failed to remove state file"),
    }
}
