use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use arm_image_builder_macros::Step;

use crate::config::ChrootMount;
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::pipeline::{BuildState, Step};
use crate::steps::{in_root, sh_path, sh_quote};

const TEARDOWN_LIMIT: Duration = Duration::from_secs(30);

fn mount_command(m: &ChrootMount, target: &Path) -> String {
    if m.is_bind() {
        format!("mount --bind {} {}", sh_quote(&m.source), sh_path(target))
    } else {
        format!(
            "mount -t {} {} {}",
            sh_quote(&m.fs_type),
            sh_quote(&m.source),
            sh_path(target)
        )
    }
}

// Bind-mounting a file needs a file to mount over.
fn prepare_target(m: &ChrootMount, target: &Path) -> Result<()> {
    if m.is_bind() && Path::new(&m.source).is_file() {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        if fs::symlink_metadata(target).is_err() {
            fs::write(target, b"")?;
        }
        return Ok(());
    }
    fs::create_dir_all(target)
        .map_err(|e| Error::msg(format!("failed to create {}: {e}", target.display())))
}

/// Host filesystems (`/proc`, `/dev`, ...) mounted into the chroot.
#[Step(id = "chroot.mount_extra", label = "Mounting chroot filesystems", privileged = true)]
#[derive(Debug, Default)]
pub struct MountExtraStep {
    mounted: Vec<PathBuf>,
}

impl Step for MountExtraStep {
    fn run(&mut self, state: &mut BuildState, ctx: &ExecCtx) -> Result<()> {
        let root = state.mount_path()?.to_path_buf();
        for m in &state.config.chroot_mounts {
            ctx.check_cancelled()?;
            let target = in_root(&root, &m.target);
            prepare_target(m, &target)?;
            ctx.run_shell(&mount_command(m, &target))?;
            self.mounted.push(target);
        }
        Ok(())
    }

    fn cleanup(&mut self, _state: &mut BuildState, ctx: &ExecCtx) -> Result<()> {
        let ctx = ctx.with_time_limit(TEARDOWN_LIMIT);
        let mut failed = Vec::new();
        while let Some(target) = self.mounted.pop() {
            // grep exits 1 when the mount is already gone.
            match ctx.shell_status(&format!("grep {} /proc/mounts", sh_path(&target))) {
                Ok(1) => continue,
                Ok(_) => {}
                Err(e) => tracing::debug!("mount check for {} failed: {e}", target.display()),
            }
            if let Err(e) = ctx.run_shell(&format!("umount {}", sh_path(&target))) {
                failed.push(e.to_string());
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::msg(failed.join("; ")))
        }
    }
}

/// Kills whatever still holds the chroot open so the mounts can come down.
/// Sits after [`MountExtraStep`] so its cleanup runs first.
#[Step(id = "chroot.fuser", label = "Preparing chroot teardown", privileged = true)]
#[derive(Debug, Default)]
pub struct MountCleanupStep {
    root: Option<PathBuf>,
}

impl Step for MountCleanupStep {
    fn run(&mut self, state: &mut BuildState, _ctx: &ExecCtx) -> Result<()> {
        self.root = Some(state.mount_path()?.to_path_buf());
        Ok(())
    }

    fn cleanup(&mut self, _state: &mut BuildState, ctx: &ExecCtx) -> Result<()> {
        let Some(root) = self.root.take() else {
            return Ok(());
        };
        ctx.with_time_limit(TEARDOWN_LIMIT)
            .run_shell(&format!("fuser -k {} || exit 0", sh_path(&root)))
    }
}
