use std::fs::{self, File, OpenOptions};
use std::path::Path;

use arm_image_builder_macros::Step;
use fs2::FileExt;

use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::pipeline::{BuildState, Step};

/// Loop devices and binfmt_misc entries are host-global, so only one build
/// may hold them at a time. The lock is released in cleanup, after
/// everything mapped or registered later has been torn down.
#[Step(id = "host.lock", label = "Acquiring host lock", privileged = false)]
#[derive(Debug, Default)]
pub struct HostLockStep {
    held: Option<File>,
}

pub(crate) fn acquire(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", parent.display())))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| Error::msg(format!("failed to open lock {}: {e}", path.display())))?;
    file.try_lock_exclusive()
        .map_err(|_| Error::msg(format!("another build holds {}", path.display())))?;
    Ok(file)
}

impl Step for HostLockStep {
    fn run(&mut self, state: &mut BuildState, _ctx: &ExecCtx) -> Result<()> {
        let lock = &state.config.lock_file;
        self.held = Some(acquire(lock)?);
        tracing::debug!(lock = %lock.display(), "host lock acquired");
        Ok(())
    }

    fn cleanup(&mut self, _state: &mut BuildState, _ctx: &ExecCtx) -> Result<()> {
        if let Some(file) = self.held.take() {
            FileExt::unlock(&file)
                .map_err(|e| Error::msg(format!("failed to release host lock: {e}")))?;
        }
        Ok(())
    }
}
