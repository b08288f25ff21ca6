//! Server launch arguments, process spawning and the ready handshake.

use crate::control::{BootHeader, BOOT_HOST_ACK, BOOT_SERVER_READY};
use crate::error::{BridgeError, LoadStage, Result};
use crate::protocol::BridgeConfig;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::str::FromStr;
use std::time::{Duration, Instant};

pub const SERVER_BINARY_NAME: &str = "linbridge-server";

/// Environment variable carrying the shared-memory name prefix to the server.
pub const SHM_PREFIX_ENV: &str = "LINBRIDGE_SHM_PREFIX";

/// Raw index meaning "first compatible module in the container".
pub const FIRST_COMPATIBLE_INDEX: u32 = 10000;

const HANDSHAKE_POLL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleIndex {
    FirstCompatible,
    Index(u32),
}

impl ModuleIndex {
    pub fn to_raw(self) -> u32 {
        match self {
            ModuleIndex::FirstCompatible => FIRST_COMPATIBLE_INDEX,
            ModuleIndex::Index(i) => i,
        }
    }

    pub fn from_raw(raw: u32) -> Self {
        if raw == FIRST_COMPATIBLE_INDEX {
            ModuleIndex::FirstCompatible
        } else {
            ModuleIndex::Index(raw)
        }
    }
}

/// The server's single command-line argument: `<index>,<path>,<session>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootArgs {
    pub module: ModuleIndex,
    pub path: PathBuf,
    pub session: String,
}

impl fmt::Display for BootArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{}",
            self.module.to_raw(),
            self.path.display(),
            self.session
        )
    }
}

impl FromStr for BootArgs {
    type Err = BridgeError;

    fn from_str(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let unquoted = trimmed
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .unwrap_or(trimmed);

        let invalid = |what: &str| BridgeError::InvalidArgument(format!("{what} in {raw:?}"));

        // The path may itself contain commas, so split on the outermost ones
        let (index, rest) = unquoted.split_once(',').ok_or_else(|| invalid("missing path"))?;
        let (path, session) = rest.rsplit_once(',').ok_or_else(|| invalid("missing session"))?;

        let index: u32 = index
            .trim()
            .parse()
            .map_err(|_| invalid("bad module index"))?;
        let path = match path.strip_prefix("//") {
            Some(stripped) => format!("/{stripped}"),
            None => path.to_string(),
        };
        if path.is_empty() {
            return Err(invalid("empty path"));
        }
        if session.is_empty() {
            return Err(invalid("empty session"));
        }

        Ok(BootArgs {
            module: ModuleIndex::from_raw(index),
            path: PathBuf::from(path),
            session: session.to_string(),
        })
    }
}

pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

// ============================================================================
// Launching
// ============================================================================

/// A running server, as seen by the host.
pub trait ServerProcess: Send {
    fn has_exited(&mut self) -> bool;

    /// Wait up to `timeout` for exit. Returns true if it exited.
    fn wait_timeout(&mut self, timeout: Duration) -> bool;

    fn kill(&mut self);
}

impl ServerProcess for Child {
    fn has_exited(&mut self) -> bool {
        !matches!(self.try_wait(), Ok(None))
    }

    fn wait_timeout(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.has_exited() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn kill(&mut self) {
        let _ = Child::kill(self);
        let _ = self.wait();
    }
}

pub trait ServerLauncher: Send + Sync {
    fn launch(&self, args: &BootArgs) -> Result<Box<dyn ServerProcess>>;
}

/// Spawns the server executable as a child process.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    shm_prefix: Option<String>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            shm_prefix: None,
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Result<Self> {
        Ok(Self {
            program: resolve_server_path(config)?,
            shm_prefix: Some(config.shm_prefix.clone()),
        })
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl ServerLauncher for ProcessLauncher {
    fn launch(&self, args: &BootArgs) -> Result<Box<dyn ServerProcess>> {
        let mut command = Command::new(&self.program);
        command.arg(args.to_string());
        if let Some(prefix) = &self.shm_prefix {
            command.env(SHM_PREFIX_ENV, prefix);
        }
        if let Some(prefix) = wine_prefix_for(&args.path) {
            command.env("WINEPREFIX", prefix);
        }

        tracing::info!(program = %self.program.display(), args = %args, "spawning server");
        let child = command.spawn().map_err(|e| BridgeError::LoadFailed {
            path: self.program.clone(),
            stage: LoadStage::Spawning,
            reason: e.to_string(),
        })?;
        Ok(Box::new(child))
    }
}

/// Configured server path, else the server binary next to the current executable.
pub fn resolve_server_path(config: &BridgeConfig) -> Result<PathBuf> {
    if let Some(path) = &config.server_path {
        return Ok(path.clone());
    }
    let mut path = std::env::current_exe().map_err(BridgeError::Io)?;
    path.pop();
    path.push(SERVER_BINARY_NAME);
    Ok(path)
}

/// The Wine prefix owning `module`: the parent of its `drive_c` ancestor.
pub fn wine_prefix_for(module: &Path) -> Option<PathBuf> {
    module
        .ancestors()
        .find(|p| p.file_name().is_some_and(|n| n == "drive_c"))
        .and_then(|drive_c| drive_c.parent())
        .map(Path::to_path_buf)
}

// ============================================================================
// Ready handshake
// ============================================================================

/// Host side: wait for the server's ready value, then acknowledge it.
/// `server_alive` is polled so a crashed server fails fast.
pub fn await_server_ready(
    boot: &BootHeader,
    timeout: Duration,
    mut server_alive: impl FnMut() -> bool,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        if boot.state() == BOOT_SERVER_READY {
            boot.set_state(BOOT_HOST_ACK);
            return Ok(());
        }
        if !server_alive() {
            return Err(BridgeError::ConnectionFailed(
                "server exited before the ready handshake".to_string(),
            ));
        }
        if Instant::now() >= deadline {
            return Err(BridgeError::Timeout {
                operation: "server ready handshake".to_string(),
                duration_ms: timeout.as_millis() as u64,
            });
        }
        std::thread::sleep(HANDSHAKE_POLL);
    }
}

/// Server side: publish readiness and wait for the host's acknowledgement.
pub fn announce_ready(boot: &BootHeader, timeout: Duration) -> Result<()> {
    boot.set_state(BOOT_SERVER_READY);
    let deadline = Instant::now() + timeout;
    while boot.state() != BOOT_HOST_ACK {
        if Instant::now() >= deadline {
            return Err(BridgeError::Timeout {
                operation: "host acknowledgement".to_string(),
                duration_ms: timeout.as_millis() as u64,
            });
        }
        std::thread::sleep(HANDSHAKE_POLL);
    }
    Ok(())
}
