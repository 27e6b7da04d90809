// sense-camera/src/permission.rs
//! Camera-access authorization.
//!
//! A gate answers two questions: "may we capture right now?" (synchronous,
//! cached) and "please ask the user" (asynchronous, answered exactly once).
//! The result callback may run on any thread; callers that touch UI-facing
//! state must marshal it themselves.

use log::{debug, info};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionState {
    Authorized,
    Denied,
    /// Blocked by policy; the user cannot grant it either.
    Restricted,
    NotDetermined,
}

impl PermissionState {
    pub fn is_authorized(self) -> bool {
        self == PermissionState::Authorized
    }

    pub fn is_determined(self) -> bool {
        self != PermissionState::NotDetermined
    }
}

pub type PermissionCallback = Box<dyn FnOnce(PermissionState) + Send + 'static>;

pub trait PermissionGate: Send + Sync {
    /// Cached platform state. No side effects.
    fn current_status(&self) -> PermissionState;

    /// Prompt the user if the state is `NotDetermined`; otherwise resolve
    /// `on_result` synchronously with the current state.
    ///
    /// `on_result` is invoked exactly once, possibly from another thread.
    fn request_access(&self, on_result: PermissionCallback);
}

// ----------------------------------------------------------------------------
// DevicePermissionGate: filesystem access to a V4L2 node
// ----------------------------------------------------------------------------

/// On Linux, "camera permission" is read/write access to the device node.
///
/// There is no interactive prompt, so this gate never reports
/// `NotDetermined` and `request_access` always resolves immediately.
#[derive(Debug, Clone)]
pub struct DevicePermissionGate {
    path: PathBuf,
}

impl DevicePermissionGate {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn probe_access(path: &Path) -> PermissionState {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        return PermissionState::Restricted;
    };
    // SAFETY: c_path is a valid NUL-terminated string that outlives the call.
    let rc = unsafe { libc::access(c_path.as_ptr(), libc::R_OK | libc::W_OK) };
    if rc == 0 {
        return PermissionState::Authorized;
    }
    match std::io::Error::last_os_error().raw_os_error() {
        Some(libc::EACCES) => PermissionState::Denied,
        _ => PermissionState::Restricted,
    }
}

#[cfg(not(unix))]
fn probe_access(_path: &Path) -> PermissionState {
    PermissionState::Restricted
}

impl PermissionGate for DevicePermissionGate {
    fn current_status(&self) -> PermissionState {
        probe_access(&self.path)
    }

    fn request_access(&self, on_result: PermissionCallback) {
        let status = self.current_status();
        debug!("{} access is {:?}", self.path.display(), status);
        on_result(status);
    }
}

// ----------------------------------------------------------------------------
// ScriptedPermissionGate: prompt with a predetermined user answer
// ----------------------------------------------------------------------------

struct ScriptState {
    status: PermissionState,
    prompting: bool,
    waiting: Vec<PermissionCallback>,
    prompts: usize,
}

/// Gate whose user answer is decided up front.
///
/// While `NotDetermined`, `request_access` shows one "prompt" at a time and
/// answers from a separate thread after `prompt_delay`, the way a platform
/// dialog calls back from its own queue. Requests made while a prompt is
/// open wait for the same answer.
#[derive(Clone)]
pub struct ScriptedPermissionGate {
    shared: Arc<Mutex<ScriptState>>,
    decision: PermissionState,
    prompt_delay: Duration,
}

fn lock(m: &Mutex<ScriptState>) -> MutexGuard<'_, ScriptState> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ScriptedPermissionGate {
    /// The user answers `Authorized` by default.
    pub fn new(initial: PermissionState) -> Self {
        Self {
            shared: Arc::new(Mutex::new(ScriptState {
                status: initial,
                prompting: false,
                waiting: Vec::new(),
                prompts: 0,
            })),
            decision: PermissionState::Authorized,
            prompt_delay: Duration::from_millis(10),
        }
    }

    /// What the user will pick when prompted (`Authorized` or `Denied`).
    pub fn with_user_decision(mut self, decision: PermissionState) -> Self {
        self.decision = decision;
        self
    }

    pub fn with_prompt_delay(mut self, delay: Duration) -> Self {
        self.prompt_delay = delay;
        self
    }

    /// How many times the user was actually prompted.
    pub fn prompts(&self) -> usize {
        lock(&self.shared).prompts
    }

    /// Simulate the user flipping the switch in system settings.
    pub fn set_status(&self, status: PermissionState) {
        lock(&self.shared).status = status;
    }
}

impl PermissionGate for ScriptedPermissionGate {
    fn current_status(&self) -> PermissionState {
        lock(&self.shared).status
    }

    fn request_access(&self, on_result: PermissionCallback) {
        let mut state = lock(&self.shared);
        if state.status.is_determined() {
            let status = state.status;
            drop(state);
            on_result(status);
            return;
        }

        state.waiting.push(on_result);
        if state.prompting {
            return;
        }
        state.prompting = true;
        state.prompts += 1;
        drop(state);

        info!("prompting for camera access");
        let shared = Arc::clone(&self.shared);
        let decision = self.decision;
        let delay = self.prompt_delay;
        thread::spawn(move || {
            thread::sleep(delay);
            let (status, waiting) = {
                let mut state = lock(&shared);
                if !state.status.is_determined() {
                    state.status = decision;
                }
                state.prompting = false;
                (state.status, std::mem::take(&mut state.waiting))
            };
            info!("user answered camera prompt: {status:?}");
            for callback in waiting {
                callback(status);
            }
        });
    }
}
