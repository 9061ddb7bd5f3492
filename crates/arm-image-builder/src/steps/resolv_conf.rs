use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use arm_image_builder_macros::Step;

use crate::config::ResolvConf;
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::pipeline::{BuildState, Step};
use crate::steps::in_root;

const RESOLV_CONF: &str = "/etc/resolv.conf";

/// `copy-host` and `delete` handling of the chroot's resolv.conf.
/// `bind-host` is an extra mount and never reaches this step.
#[Step(id = "chroot.resolv_conf", label = "Setting up resolv.conf", privileged = true)]
#[derive(Debug)]
pub struct ResolvConfStep {
    pub host_file: PathBuf,
}

impl Default for ResolvConfStep {
    fn default() -> Self {
        Self {
            host_file: PathBuf::from(RESOLV_CONF),
        }
    }
}

fn remove_existing(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::msg(format!("failed to remove {}: {e}", path.display()))),
    }
}

impl Step for ResolvConfStep {
    fn run(&mut self, state: &mut BuildState, ctx: &ExecCtx) -> Result<()> {
        let target = in_root(state.mount_path()?, RESOLV_CONF);
        match state.config.resolv_conf {
            ResolvConf::CopyHost => {
                // Images often ship resolv.conf as an absolute symlink; writing
                // through it would land on the host.
                remove_existing(&target)?;
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::copy(&self.host_file, &target).map_err(|e| {
                    Error::msg(format!(
                        "failed to copy {} to {}: {e}",
                        self.host_file.display(),
                        target.display()
                    ))
                })?;
                ctx.ui.message("copied host resolv.conf into the image");
            }
            ResolvConf::Delete => {
                remove_existing(&target)?;
                ctx.ui.message("removed resolv.conf from the image");
            }
            ResolvConf::Off | ResolvConf::BindHost => {}
        }
        Ok(())
    }
}
