use anyhow::Context;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::process::Command;

/// Environment variable the askpass script reads the password from.
pub const SSH_PASSWORD_ENV: &str = "DELIVER_SSH_PASS";

const ASKPASS_FILE: &str = "ssh-askpass.sh";
const ASKPASS_SCRIPT: &str = "#!/bin/sh\nprintf '%s\\n' \"$DELIVER_SSH_PASS\"\n";

static STAGING_SEQ: AtomicUsize = AtomicUsize::new(0);

/// `SSH_ASKPASS` helper that answers ssh's password prompt from the child's
/// environment, so the password never shows up in argv or on disk.
#[derive(Clone, Debug)]
pub struct Askpass {
    script: PathBuf,
}

impl Askpass {
    /// Installs the helper under `~/.deliver`.
    pub fn install_default() -> anyhow::Result<Self> {
        let home = std::env::var_os("HOME").context("failed to resolve HOME for askpass")?;
        Self::install(&PathBuf::from(home).join(".deliver"))
    }

    pub fn install(dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let script = dir.join(ASKPASS_FILE);
        let current = std::fs::read(&script).ok();
        if current.as_deref() != Some(ASKPASS_SCRIPT.as_bytes()) {
            // Staged then renamed: a concurrent ssh must never run a half-written helper.
            let staging = dir.join(format!(
                ".{ASKPASS_FILE}.{}.{}",
                std::process::id(),
                STAGING_SEQ.fetch_add(1, Ordering::Relaxed)
            ));
            write_executable(&staging, ASKPASS_SCRIPT)?;
            if let Err(err) = std::fs::rename(&staging, &script) {
                let _ = std::fs::remove_file(&staging);
                return Err(err).with_context(|| format!("failed to install {}", script.display()));
            }
        }
        Ok(Self { script })
    }

    pub fn script(&self) -> &Path {
        &self.script
    }

    pub fn env(&self, password: &str) -> [(&'static str, OsString); 4] {
        [
            (SSH_PASSWORD_ENV, password.into()),
            ("SSH_ASKPASS", self.script.clone().into_os_string()),
            ("SSH_ASKPASS_REQUIRE", "force".into()),
            // ssh before 8.4 ignores SSH_ASKPASS without a DISPLAY.
            ("DISPLAY", "1".into()),
        ]
    }

    pub fn apply(&self, cmd: &mut Command, password: &str) {
        cmd.envs(self.env(password));
    }
}

fn write_executable(path: &Path, contents: &str) -> anyhow::Result<()> {
    std::fs::write(path, contents).with_context(|| format!("failed to write {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
            .with_context(|| format!("failed to chmod {}", path.display()))?;
    }
    Ok(())
}

/// Single-quotes `value` for a POSIX shell.
pub fn shell_escape(value: &str) -> String {
    let escaped = value.replace('\'', "'\\''");
    format!("'{}'", escaped)
}

pub fn join_remote(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}
