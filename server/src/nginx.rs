//! Pure side-effect module wrapping the external `nginx` binary.
//!
//! Grounded on `original_source/generator/nginx.go` (temp-file render
//! step) and spec.md section 4.5/4.7. The subprocess invocation is
//! hidden behind [`NginxRunner`] so tests can substitute a fake that
//! records calls and returns scripted exit codes, per spec.md section
//! 9's Design Notes — the same "narrow interface, fake in tests"
//! discipline `macwilam-linksense/server/src/reconfigure.rs` uses
//! around filesystem effects.

use std::path::{Path, PathBuf};
use tokio::process::Command;

#[async_trait::async_trait]
pub trait NginxRunner: Send + Sync {
    async fn validate(&self, config_path: &Path) -> std::io::Result<std::process::Output>;
    async fn reload(&self) -> std::io::Result<std::process::Output>;
}

pub struct TokioProcessRunner {
    binary: String,
}

impl TokioProcessRunner {
    pub fn new() -> Self {
        Self {
            binary: "nginx".to_string(),
        }
    }
}

impl Default for TokioProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl NginxRunner for TokioProcessRunner {
    async fn validate(&self, config_path: &Path) -> std::io::Result<std::process::Output> {
        Command::new(&self.binary)
            .arg("-c")
            .arg(config_path)
            .arg("-t")
            .output()
            .await
    }

    async fn reload(&self) -> std::io::Result<std::process::Output> {
        Command::new(&self.binary).arg("-s").arg("reload").output().await
    }
}

/// Driver over the external `nginx` binary: validate, atomically swap
/// a rendered temp file into place, and signal a reload.
pub struct NginxDriver {
    runner: Box<dyn NginxRunner>,
}

impl NginxDriver {
    pub fn new(runner: Box<dyn NginxRunner>) -> Self {
        Self { runner }
    }

    /// Writes `rendered` to a uniquely-named temp file in the same
    /// directory as `target_config`, so the later rename is atomic on
    /// the same filesystem (spec.md section 4.4 step 4 / section 6).
    pub fn write_temp_file(rendered: &str, target_config: &Path) -> std::io::Result<PathBuf> {
        let dir = target_config
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let temp_path = dir.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
        std::fs::write(&temp_path, rendered)?;
        Ok(temp_path)
    }

    /// Runs `nginx -c <temp_path> -t`. Non-zero exit yields a
    /// [`shared::Error::Validation`] carrying the rejected text and
    /// combined stderr.
    pub async fn validate(&self, temp_path: &Path, rendered: &str) -> shared::Result<()> {
        let output = self
            .runner
            .validate(temp_path)
            .await
            .map_err(|e| shared::Error::ExecNginx {
                stderr: e.to_string(),
            })?;
        if output.status.success() {
            Ok(())
        } else {
            Err(shared::Error::Validation {
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                rendered: rendered.to_string(),
            }
            .into())
        }
    }

    /// Compares the temp file against the current target config by
    /// size only. This is a known weak heuristic (spec.md section 9,
    /// open question 1) preserved deliberately — not replaced with a
    /// content hash.
    pub fn sizes_equal(temp_path: &Path, target_config: &Path) -> std::io::Result<bool> {
        let temp_len = std::fs::metadata(temp_path)?.len();
        let target_len = match std::fs::metadata(target_config) {
            Ok(m) => m.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        };
        Ok(temp_len == target_len)
    }

    /// Atomically renames `temp_path` over `target_config`.
    pub fn atomic_swap(temp_path: &Path, target_config: &Path) -> shared::Result<()> {
        std::fs::rename(temp_path, target_config)
            .map_err(|e| shared::Error::Filesystem(e.to_string()))?;
        Ok(())
    }

    /// Runs `nginx -s reload`.
    pub async fn reload(&self) -> shared::Result<()> {
        let output = self
            .runner
            .reload()
            .await
            .map_err(|e| shared::Error::ExecNginx {
                stderr: e.to_string(),
            })?;
        if output.status.success() {
            Ok(())
        } else {
            Err(shared::Error::ExecNginx {
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            }
            .into())
        }
    }
}

#[cfg(test)]
pub mod tests_support {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeRunner {
        pub validate_exit: Mutex<i32>,
        pub validate_stderr: Mutex<String>,
        pub reload_exit: Mutex<i32>,
        pub reload_stderr: Mutex<String>,
        pub reload_calls: Mutex<u32>,
    }

    #[cfg(unix)]
    fn output_with_status(code: i32, stderr: &str) -> std::process::Output {
        use std::os::unix::process::ExitStatusExt;
        std::process::Output {
            status: std::process::ExitStatus::from_raw(code << 8),
            stdout: Vec::new(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    #[async_trait::async_trait]
    impl NginxRunner for FakeRunner {
        async fn validate(&self, _config_path: &Path) -> std::io::Result<std::process::Output> {
            Ok(output_with_status(
                *self.validate_exit.lock().unwrap(),
                &self.validate_stderr.lock().unwrap(),
            ))
        }

        async fn reload(&self) -> std::io::Result<std::process::Output> {
            *self.reload_calls.lock().unwrap() += 1;
            Ok(output_with_status(
                *self.reload_exit.lock().unwrap(),
                &self.reload_stderr.lock().unwrap(),
            ))
        }
    }
}
