//! Elevated-privilege detection

use tracing::debug;

/// Answers whether the process may write raw devices
pub trait PrivilegeProbe: Send + Sync {
    fn is_elevated(&self) -> bool;
}

/// Checks the real host
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl PrivilegeProbe for SystemProbe {
    #[cfg(unix)]
    fn is_elevated(&self) -> bool {
        let euid = nix::unistd::geteuid();
        debug!("Effective uid: {}", euid);
        euid.is_root()
    }

    #[cfg(windows)]
    fn is_elevated(&self) -> bool {
        // `net session` only succeeds from an elevated prompt
        let elevated = std::process::Command::new("net")
            .arg("session")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .is_ok_and(|s| s.success());
        debug!("Elevated: {}", elevated);
        elevated
    }

    #[cfg(not(any(unix, windows)))]
    fn is_elevated(&self) -> bool {
        false
    }
}

/// Fixed answer, for capability-based setups and tests
#[derive(Debug, Clone, Copy)]
pub struct FixedProbe(pub bool);

impl PrivilegeProbe for FixedProbe {
    fn is_elevated(&self) -> bool {
        self.0
    }
}

/// Probe honoring the `assume_privileged` setting
pub fn probe_for(assume_privileged: bool) -> Box<dyn PrivilegeProbe> {
    if assume_privileged {
        Box::new(FixedProbe(true))
    } else {
        Box::new(SystemProbe)
    }
}
