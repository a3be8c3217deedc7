//! Lifecycle supervision for the external xray backend. One supervisor owns
//! at most one child process plus the temp config file it was launched with;
//! everything else derives from polling that child.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use sysinfo::{ProcessRefreshKind, RefreshKind, System};
use tracing::{debug, info, warn};

use crate::config;
use crate::error::{Error, Result};
use crate::model::ServerConfig;
use crate::store::ConfigStore;

#[cfg(windows)]
use std::os::windows::io::AsRawHandle;
#[cfg(windows)]
use std::os::windows::process::CommandExt;
#[cfg(windows)]
use windows_sys::Win32::Foundation::CloseHandle;
#[cfg(windows)]
use windows_sys::Win32::System::JobObjects::{
    AssignProcessToJobObject, CreateJobObjectW, JobObjectExtendedLimitInformation,
    SetInformationJobObject, JOBOBJECT_EXTENDED_LIMIT_INFORMATION,
    JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE,
};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x08000000;

#[cfg(windows)]
const BINARY_NAME: &str = "xray.exe";
#[cfg(not(windows))]
const BINARY_NAME: &str = "xray";

const SETTLE_DELAY: Duration = Duration::from_millis(500);
const STOP_TIMEOUT: Duration = Duration::from_secs(5);
const RESTART_PAUSE: Duration = Duration::from_millis(500);
const STOP_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Phase {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    FailedToStart,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Phase::Stopped => "stopped",
            Phase::Starting => "starting",
            Phase::Running => "running",
            Phase::Stopping => "stopping",
            Phase::FailedToStart => "failed_to_start",
        }
    }
}

#[derive(Default)]
struct SupervisorState {
    child: Option<Child>,
    phase: Phase,
    config_path: Option<PathBuf>,
    last_exit: Option<i32>,
    last_error: Option<String>,
    #[cfg(windows)]
    job: Option<JobHandle>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendStatus {
    pub running: bool,
    pub state: &'static str,
    pub pid: Option<u32>,
    pub config_path: Option<String>,
    pub last_exit: Option<i32>,
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
}

pub struct XrayManager {
    store: ConfigStore,
    state: Mutex<SupervisorState>,
    binary_path: Option<PathBuf>,
    settle: Duration,
    stop_timeout: Duration,
    restart_pause: Duration,
}

impl XrayManager {
    pub fn new(store: ConfigStore) -> Self {
        Self::with_timing(store, SETTLE_DELAY, STOP_TIMEOUT)
    }

    /// Supervisor with shortened waits. The timings only affect how long
    /// start and stop block, never the decision logic.
    pub fn with_timing(store: ConfigStore, settle: Duration, stop_timeout: Duration) -> Self {
        XrayManager {
            store,
            state: Mutex::new(SupervisorState::default()),
            binary_path: None,
            settle,
            stop_timeout,
            restart_pause: RESTART_PAUSE,
        }
    }

    /// Pins the backend binary instead of discovering it.
    pub fn binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.binary_path = Some(path.into());
        self
    }

    /// Launches the backend for the given server, or for the selected
    /// outbound of the last-selected profile when none is passed. Returns
    /// `Ok(false)` when a backend is already running or the child exits
    /// during the settle window.
    pub fn start(&self, server: Option<&ServerConfig>) -> Result<bool> {
        let mut guard = self.lock();
        refresh(&mut guard);
        if guard.child.is_some() {
            debug!("start ignored, backend already running");
            return Ok(false);
        }

        let server = match server {
            Some(server) => server.clone(),
            None => self
                .store
                .active_server()
                .ok_or(Error::NotFound("server"))?,
        };
        let binary = self.locate_binary()?;
        let wire_config = config::build(
            &server,
            &self.store.inbound_settings(),
            &self.store.build_options(),
        )?;
        let config_path = write_temp_config(&wire_config)?;

        guard.phase = Phase::Starting;
        guard.last_exit = None;
        guard.last_error = None;

        let mut cmd = Command::new(&binary);
        cmd.arg("run").arg("-c").arg(&config_path);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                remove_file_quiet(&config_path);
                guard.phase = Phase::Stopped;
                return Err(Error::Process(format!(
                    "failed to spawn {}: {e}",
                    binary.display()
                )));
            }
        };

        #[cfg(windows)]
        self.assign_to_job(&mut guard, &child);

        // Give the backend a moment to parse its config and bind sockets;
        // a config rejection shows up as an immediate exit.
        std::thread::sleep(self.settle);
        match child.try_wait() {
            Ok(Some(status)) => {
                let detail = read_stderr(&mut child);
                warn!(code = ?status.code(), %detail, "backend exited during startup");
                remove_file_quiet(&config_path);
                guard.phase = Phase::FailedToStart;
                guard.last_exit = status.code();
                guard.last_error = Some(detail);
                Ok(false)
            }
            Ok(None) => {
                info!(pid = child.id(), binary = %binary.display(), "backend started");
                guard.child = Some(child);
                guard.config_path = Some(config_path);
                guard.phase = Phase::Running;
                Ok(true)
            }
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                remove_file_quiet(&config_path);
                guard.phase = Phase::Stopped;
                Err(Error::Process(format!("failed to poll backend: {e}")))
            }
        }
    }

    /// Graceful stop with a bounded wait, then force-kill. The temp config
    /// file is removed and the handle cleared on every exit path.
    pub fn stop(&self) -> Result<bool> {
        let mut guard = self.lock();
        refresh(&mut guard);
        let Some(mut child) = guard.child.take() else {
            debug!("stop ignored, backend not running");
            return Ok(false);
        };
        guard.phase = Phase::Stopping;

        request_termination(&mut child);
        let deadline = Instant::now() + self.stop_timeout;
        let exit = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status.code(),
                Ok(None) => {
                    if Instant::now() >= deadline {
                        warn!(pid = child.id(), "backend ignored termination, killing");
                        let _ = child.kill();
                        let _ = child.wait();
                        break None;
                    }
                    std::thread::sleep(STOP_POLL);
                }
                Err(e) => {
                    warn!(%e, "failed to poll backend during stop");
                    let _ = child.kill();
                    let _ = child.wait();
                    break None;
                }
            }
        };

        if let Some(path) = guard.config_path.take() {
            remove_file_quiet(&path);
        }
        guard.last_exit = exit;
        guard.phase = Phase::Stopped;
        info!("backend stopped");
        Ok(true)
    }

    pub fn restart(&self, server: Option<&ServerConfig>) -> Result<bool> {
        self.stop()?;
        std::thread::sleep(self.restart_pause);
        self.start(server)
    }

    /// Non-blocking liveness poll. A child that exited since the last call
    /// is reaped here and its temp config removed.
    pub fn is_running(&self) -> bool {
        let mut guard = self.lock();
        refresh(&mut guard);
        guard.child.is_some()
    }

    pub fn get_status(&self) -> BackendStatus {
        let mut guard = self.lock();
        refresh(&mut guard);
        let pid = guard.child.as_ref().map(|c| c.id());
        let mut status = BackendStatus {
            running: pid.is_some(),
            state: guard.phase.as_str(),
            pid,
            config_path: guard
                .config_path
                .as_ref()
                .map(|p| p.display().to_string()),
            last_exit: guard.last_exit,
            last_error: guard.last_error.clone(),
            cpu_percent: None,
            memory_bytes: None,
            started_at: None,
        };
        drop(guard);

        if let Some(pid) = pid {
            attach_metrics(&mut status, pid);
        }
        status
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SupervisorState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Discovery order: pinned path if it exists, then PATH, then the
    /// conventional install locations for the platform.
    fn locate_binary(&self) -> Result<PathBuf> {
        if let Some(path) = &self.binary_path {
            if path.is_file() {
                return Ok(path.clone());
            }
            warn!(path = %path.display(), "configured backend binary missing");
        }
        if let Some(path) = find_in_path(BINARY_NAME) {
            return Ok(path);
        }
        for candidate in conventional_locations() {
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        Err(Error::NotFound("xray binary"))
    }

    #[cfg(windows)]
    fn assign_to_job(&self, guard: &mut SupervisorState, child: &Child) {
        if guard.job.is_none() {
            match create_job_object() {
                Ok(job) => guard.job = Some(job),
                Err(e) => warn!(%e, "failed to create job object"),
            }
        }
        if let Some(job) = guard.job.as_ref() {
            let result =
                unsafe { AssignProcessToJobObject(job.0, child.as_raw_handle() as isize) };
            if result == 0 {
                warn!("failed to assign backend to job object");
            }
        }
    }
}

impl Drop for XrayManager {
    fn drop(&mut self) {
        let mut guard = self.lock();
        if let Some(mut child) = guard.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        if let Some(path) = guard.config_path.take() {
            remove_file_quiet(&path);
        }
    }
}

fn refresh(state: &mut SupervisorState) {
    if let Some(child) = state.child.as_mut() {
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(code = ?status.code(), "backend exited, reaping");
                state.last_exit = status.code();
                state.child = None;
                state.phase = Phase::Stopped;
                if let Some(path) = state.config_path.take() {
                    remove_file_quiet(&path);
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(%e, "failed to poll backend, dropping handle");
                state.last_exit = Some(-1);
                state.last_error = Some(e.to_string());
                state.child = None;
                state.phase = Phase::Stopped;
                if let Some(path) = state.config_path.take() {
                    remove_file_quiet(&path);
                }
            }
        }
    }
}

/// A fresh config file per start, left on disk for the child to read and
/// removed when the child goes away.
fn write_temp_config(wire_config: &serde_json::Value) -> Result<PathBuf> {
    let content = serde_json::to_string_pretty(wire_config)?;
    let file = tempfile::Builder::new()
        .prefix("xenray-")
        .suffix(".json")
        .tempfile()?;
    std::fs::write(file.path(), content)?;
    let path = file.into_temp_path().keep().map_err(|e| Error::Io(e.error))?;
    Ok(path)
}

fn remove_file_quiet(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            debug!(path = %path.display(), %e, "failed to remove temp config");
        }
    }
}

fn read_stderr(child: &mut Child) -> String {
    let mut detail = String::new();
    if let Some(mut stderr) = child.stderr.take() {
        let _ = stderr.read_to_string(&mut detail);
    }
    let trimmed = detail.trim();
    if trimmed.is_empty() {
        "backend exited during startup".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(unix)]
fn request_termination(child: &mut Child) {
    let result = unsafe { libc::kill(child.id() as libc::pid_t, libc::SIGTERM) };
    if result != 0 {
        let _ = child.kill();
    }
}

#[cfg(not(unix))]
fn request_termination(child: &mut Child) {
    let _ = child.kill();
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

#[cfg(windows)]
fn conventional_locations() -> Vec<PathBuf> {
    let mut locations = Vec::new();
    if let Some(program_files) = std::env::var_os("ProgramFiles") {
        locations.push(PathBuf::from(program_files).join("Xray").join(BINARY_NAME));
    }
    locations
}

#[cfg(not(windows))]
fn conventional_locations() -> Vec<PathBuf> {
    ["/usr/local/bin", "/usr/bin", "/opt/homebrew/bin", "/opt/xray"]
        .iter()
        .map(|dir| Path::new(dir).join(BINARY_NAME))
        .collect()
}

/// Pids of backend processes already running on the system, matched by
/// executable name. Used to adopt or stop a backend this process did not
/// spawn.
pub fn find_backend_pids() -> Vec<u32> {
    let system = System::new_with_specifics(
        RefreshKind::new().with_processes(ProcessRefreshKind::new()),
    );
    system
        .processes()
        .iter()
        .filter(|(_, process)| process.name().trim_end_matches(".exe") == "xray")
        .map(|(pid, _)| pid.as_u32())
        .collect()
}

/// Terminates a backend by pid: graceful signal, bounded wait, then kill.
#[cfg(unix)]
pub fn terminate_backend(pid: u32, timeout: Duration) -> bool {
    let pid = pid as libc::pid_t;
    if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
        return false;
    }
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if unsafe { libc::kill(pid, 0) } != 0 {
            return true;
        }
        std::thread::sleep(STOP_POLL);
    }
    warn!(pid, "backend ignored termination, killing");
    unsafe { libc::kill(pid, libc::SIGKILL) };
    true
}

#[cfg(windows)]
pub fn terminate_backend(pid: u32, _timeout: Duration) -> bool {
    use windows_sys::Win32::System::Threading::{OpenProcess, TerminateProcess, PROCESS_TERMINATE};
    unsafe {
        let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
        if handle == 0 {
            return false;
        }
        let result = TerminateProcess(handle, 0);
        CloseHandle(handle);
        result != 0
    }
}

fn attach_metrics(status: &mut BackendStatus, pid: u32) {
    let sys_pid = sysinfo::Pid::from_u32(pid);
    let system = System::new_with_specifics(
        RefreshKind::new().with_processes(ProcessRefreshKind::new().with_cpu().with_memory()),
    );
    match system.process(sys_pid) {
        Some(process) => {
            status.cpu_percent = Some(process.cpu_usage());
            status.memory_bytes = Some(process.memory());
            status.started_at = Some(process.start_time());
        }
        None => debug!(pid, "backend process not visible to metrics collector"),
    }
}

#[cfg(windows)]
#[derive(Debug)]
struct JobHandle(isize);

#[cfg(windows)]
impl Drop for JobHandle {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.0);
        }
    }
}

#[cfg(windows)]
fn create_job_object() -> std::io::Result<JobHandle> {
    let handle = unsafe { CreateJobObjectW(std::ptr::null_mut(), std::ptr::null()) };
    if handle == 0 {
        return Err(std::io::Error::last_os_error());
    }
    let mut info: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = unsafe { std::mem::zeroed() };
    info.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;
    let result = unsafe {
        SetInformationJobObject(
            handle,
            JobObjectExtendedLimitInformation,
            &mut info as *mut _ as *mut _,
            std::mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
        )
    };
    if result == 0 {
        unsafe {
            CloseHandle(handle);
        }
        return Err(std::io::Error::last_os_error());
    }
    Ok(JobHandle(handle))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn fake_backend(dir: &Path, script: &str) -> PathBuf {
        let path = dir.join("fake-xray");
        std::fs::write(&path, script).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn server() -> ServerConfig {
        let mut server = ServerConfig::new("vless", "a.example.com", 443);
        server.uuid = Some("9f2c1b1e-8f58-4c7e-ae26-1f1a1f2d3c4b".to_string());
        server
    }

    fn manager(dir: &Path, script: &str) -> XrayManager {
        let store = ConfigStore::with_dir(dir.join("store")).unwrap();
        XrayManager::with_timing(
            store,
            Duration::from_millis(50),
            Duration::from_secs(2),
        )
        .binary(fake_backend(dir, script))
    }

    #[test]
    fn second_start_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), "#!/bin/sh\nsleep 30\n");
        assert!(mgr.start(Some(&server())).unwrap());
        assert!(!mgr.start(Some(&server())).unwrap());
        assert!(mgr.stop().unwrap());
        assert!(!mgr.stop().unwrap());
    }

    #[test]
    fn early_exit_reports_failed_start() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), "#!/bin/sh\necho 'bad config' >&2\nexit 3\n");
        assert!(!mgr.start(Some(&server())).unwrap());
        assert!(!mgr.is_running());
        let status = mgr.get_status();
        assert_eq!(status.last_exit, Some(3));
        assert!(status.last_error.unwrap().contains("bad config"));
    }

    #[test]
    fn is_running_self_heals_after_backend_death() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), "#!/bin/sh\nsleep 0.2\n");
        assert!(mgr.start(Some(&server())).unwrap());
        assert!(mgr.is_running());
        let config_path = PathBuf::from(mgr.get_status().config_path.unwrap());
        assert!(config_path.exists());

        std::thread::sleep(Duration::from_millis(500));
        assert!(!mgr.is_running());
        assert!(!config_path.exists());
        assert!(!mgr.stop().unwrap());
    }

    #[test]
    fn status_reports_pid_and_config_path() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), "#!/bin/sh\nsleep 30\n");
        assert!(mgr.start(Some(&server())).unwrap());
        let status = mgr.get_status();
        assert!(status.running);
        assert!(status.pid.is_some());
        assert!(status.config_path.is_some());
        mgr.stop().unwrap();
        let status = mgr.get_status();
        assert!(!status.running);
        assert!(status.pid.is_none());
    }

    #[test]
    fn start_without_server_or_selection_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), "#!/bin/sh\nsleep 30\n");
        assert!(matches!(mgr.start(None), Err(Error::NotFound(_))));
    }

    #[test]
    fn restart_replaces_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), "#!/bin/sh\nsleep 30\n");
        assert!(mgr.start(Some(&server())).unwrap());
        let first_pid = mgr.get_status().pid.unwrap();
        assert!(mgr.restart(Some(&server())).unwrap());
        let second_pid = mgr.get_status().pid.unwrap();
        assert_ne!(first_pid, second_pid);
        mgr.stop().unwrap();
    }
}
