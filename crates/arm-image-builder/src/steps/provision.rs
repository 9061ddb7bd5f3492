use std::fs;
use std::path::{Path, PathBuf};

use arm_image_builder_macros::Step;
use walkdir::WalkDir;

use crate::config::{ProvisionerConfig, ShellProvisionerConfig};
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::pipeline::{BuildState, Step};
use crate::steps::{in_root, sh_path, sh_quote};

/// Runs commands and moves files inside the image.
pub trait Communicator {
    fn run(&self, command: &str) -> Result<()>;
    /// Copies a host file or directory to `dst` inside the image.
    fn upload(&self, src: &Path, dst: &Path) -> Result<()>;
    /// Copies `src` inside the image out to the host.
    fn download(&self, src: &Path, dst: &Path) -> Result<()>;
}

/// User provisioning, run once with the chroot ready.
pub trait ProvisionHook: Send {
    fn provision(&mut self, ctx: &ExecCtx, comm: &dyn Communicator) -> Result<()>;
}

pub struct ChrootCommunicator {
    root: PathBuf,
    ctx: ExecCtx,
}

impl ChrootCommunicator {
    pub fn new(root: impl Into<PathBuf>, ctx: ExecCtx) -> Self {
        Self {
            root: root.into(),
            ctx,
        }
    }

    pub fn command_line(&self, command: &str) -> String {
        format!("chroot {} /bin/sh -c {}", sh_path(&self.root), sh_quote(command))
    }
}

fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    if src.is_file() {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(src, dst).map_err(|e| {
            Error::msg(format!(
                "failed to copy {} to {}: {e}",
                src.display(),
                dst.display()
            ))
        })?;
        return Ok(());
    }
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|e| Error::msg(format!("failed to walk {}: {e}", src.display())))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| Error::msg(format!("bad path {}: {e}", entry.path().display())))?;
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            fs::copy(entry.path(), &target).map_err(|e| {
                Error::msg(format!(
                    "failed to copy {} to {}: {e}",
                    entry.path().display(),
                    target.display()
                ))
            })?;
        }
    }
    Ok(())
}

impl Communicator for ChrootCommunicator {
    fn run(&self, command: &str) -> Result<()> {
        self.ctx.run_shell(&self.command_line(command))
    }

    fn upload(&self, src: &Path, dst: &Path) -> Result<()> {
        if !src.exists() {
            return Err(Error::msg(format!("{} does not exist", src.display())));
        }
        copy_tree(src, &in_root(&self.root, dst))
    }

    fn download(&self, src: &Path, dst: &Path) -> Result<()> {
        copy_tree(&in_root(&self.root, src), dst)
    }
}

/// Runs the `[[build.provisioners]]` entries in order.
#[derive(Debug, Default, Clone)]
pub struct ShellProvisioner {
    pub provisioners: Vec<ProvisionerConfig>,
}

impl ShellProvisioner {
    pub fn new(provisioners: Vec<ProvisionerConfig>) -> Self {
        Self { provisioners }
    }
}

fn env_prefix(cfg: &ShellProvisionerConfig) -> String {
    cfg.environment
        .iter()
        .map(|(k, v)| format!("export {k}={}; ", sh_quote(v)))
        .collect()
}

impl ProvisionHook for ShellProvisioner {
    fn provision(&mut self, ctx: &ExecCtx, comm: &dyn Communicator) -> Result<()> {
        for (idx, p) in self.provisioners.iter().enumerate() {
            ctx.check_cancelled()?;
            match p {
                ProvisionerConfig::Shell(shell) => {
                    let env = env_prefix(shell);
                    for command in &shell.inline {
                        ctx.ui.message(&format!("running: {command}"));
                        comm.run(&format!("{env}{command}"))?;
                    }
                    if let Some(script) = &shell.script {
                        let remote = PathBuf::from(format!("/tmp/armimg-script-{idx}.sh"));
                        ctx.ui.message(&format!("running script {}", script.display()));
                        comm.upload(script, &remote)?;
                        let remote = remote.display().to_string();
                        let res = comm.run(&format!("{env}chmod +x {0} && {0}", sh_quote(&remote)));
                        let cleaned = comm.run(&format!("rm -f {}", sh_quote(&remote)));
                        res?;
                        cleaned?;
                    }
                }
                ProvisionerConfig::File(file) => {
                    ctx.ui.message(&format!(
                        "uploading {} to {}",
                        file.source.display(),
                        file.destination.display()
                    ));
                    comm.upload(&file.source, &file.destination)?;
                }
            }
        }
        Ok(())
    }
}

#[Step(id = "chroot.provision", label = "Provisioning image", privileged = true)]
pub struct ProvisionStep {
    hook: Box<dyn ProvisionHook>,
}

impl ProvisionStep {
    pub fn new(hook: Box<dyn ProvisionHook>) -> Self {
        Self { hook }
    }
}

impl Step for ProvisionStep {
    fn run(&mut self, state: &mut BuildState, ctx: &ExecCtx) -> Result<()> {
        let comm = ChrootCommunicator::new(state.mount_path()?, ctx.clone());
        self.hook.provision(ctx, &comm)
    }
}
