use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::PathBuf;

use crate::config::{BuildConfig, ResolvConf, host_is_arm};
use crate::error::{Error, Result};
use crate::executor::{CommandWrapper, ExecCtx};
use crate::pipeline::{BuildState, Outcome, Pipeline, Step};
use crate::steps::{
    CopyImageStep, DownloadStep, HostLockStep, MapImageStep, MountCleanupStep, MountExtraStep,
    MountImageStep, ProvisionHook, ProvisionStep, QemuUserStaticStep, RegisterBinfmtStep,
    ResizeFsStep, ResizeLastPartitionStep, ResolvConfStep, ShellProvisioner,
};

/// The finished image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub image: PathBuf,
    pub generated_data: BTreeMap<String, String>,
}

impl Artifact {
    pub fn destroy(self) -> Result<()> {
        match fs::remove_file(&self.image) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::msg(format!(
                "failed to remove {}: {e}",
                self.image.display()
            ))),
        }
    }
}

/// Turns a prepared [`BuildConfig`] into the ordered step list and runs it.
pub struct Builder {
    config: BuildConfig,
    native: bool,
    hook: Option<Box<dyn ProvisionHook>>,
}

impl Builder {
    pub fn new(config: BuildConfig) -> Self {
        Self {
            config,
            native: host_is_arm(),
            hook: None,
        }
    }

    /// Whether the host runs the image's binaries without emulation.
    pub fn with_native(mut self, native: bool) -> Self {
        self.native = native;
        self
    }

    /// Replaces the provisioners from `[[build.provisioners]]`.
    pub fn with_hook(mut self, hook: Box<dyn ProvisionHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    pub fn steps(&mut self) -> Vec<Box<dyn Step>> {
        let cfg = &self.config;
        let mut steps: Vec<Box<dyn Step>> = vec![
            Box::new(DownloadStep),
            Box::new(CopyImageStep::default()),
        ];
        if cfg.wants_resize() {
            steps.push(Box::new(ResizeLastPartitionStep));
        }
        steps.push(Box::new(HostLockStep::default()));
        steps.push(Box::new(MapImageStep::default()));
        if cfg.wants_resize() {
            steps.push(Box::new(ResizeFsStep));
        }
        steps.push(Box::new(MountImageStep::default()));
        steps.push(Box::new(MountExtraStep::default()));
        steps.push(Box::new(MountCleanupStep::default()));
        if matches!(cfg.resolv_conf, ResolvConf::CopyHost | ResolvConf::Delete) {
            steps.push(Box::new(ResolvConfStep::default()));
        }
        if !self.native {
            steps.push(Box::new(QemuUserStaticStep::default()));
            steps.push(Box::new(RegisterBinfmtStep::default()));
        }
        let hook = self
            .hook
            .take()
            .unwrap_or_else(|| Box::new(ShellProvisioner::new(cfg.provisioners.clone())));
        steps.push(Box::new(ProvisionStep::new(hook)));
        steps
    }

    /// Runs every step. The artifact exists only if all of them succeeded.
    pub fn run(mut self, ctx: &ExecCtx) -> Result<Artifact> {
        let wrapper = CommandWrapper::new(self.config.command_wrapper.clone())?;
        let ctx = ctx.clone().with_wrapper(wrapper);
        let mut pipeline = Pipeline::new(self.steps());
        let mut state = BuildState::new(self.config);

        let outcome = pipeline.run(&mut state, &ctx);
        if !matches!(outcome, Outcome::Completed) {
            let status: Vec<String> = pipeline
                .status()
                .iter()
                .map(|(id, st)| format!("{id}={st:?}"))
                .collect();
            tracing::debug!(steps = %status.join(" "), "build stopped");
        }
        outcome.into_result()?;

        let image = state.image_path()?.to_path_buf();
        tracing::info!(image = %image.display(), "build finished");
        Ok(Artifact {
            image,
            generated_data: state.generated_data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::StepInfo;

    fn ids(builder: &mut Builder) -> Vec<&'static str> {
        builder.steps().iter().map(|s| s.id()).collect()
    }

    #[test]
    fn destroy_removes_the_image_once() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let image = tmp.path().join("image");
        fs::write(&image, b"img").unwrap();
        let artifact = Artifact {
            image: image.clone(),
            generated_data: BTreeMap::new(),
        };
        artifact.clone().destroy().unwrap();
        assert!(!image.exists());
        artifact.destroy().unwrap();
    }

    #[test]
    fn emulated_build_order() {
        let mut b = Builder::new(BuildConfig::default()).with_native(false);
        assert_eq!(
            ids(&mut b),
            vec![
                "source.download",
                "image.copy",
                "host.lock",
                "image.map",
                "image.mount",
                "chroot.mount_extra",
                "chroot.fuser",
                "qemu.install",
                "qemu.binfmt",
                "chroot.provision",
            ]
        );
    }

    #[test]
    fn native_build_with_resize_and_resolv_copy() {
        let mut cfg = BuildConfig::default();
        cfg.target_image_size = 4 << 30;
        cfg.resolv_conf = ResolvConf::CopyHost;
        let mut b = Builder::new(cfg).with_native(true);
        assert_eq!(
            ids(&mut b),
            vec![
                "source.download",
                "image.copy",
                "image.resize_partition",
                "host.lock",
                "image.map",
                "image.resize_fs",
                "image.mount",
                "chroot.mount_extra",
                "chroot.fuser",
                "chroot.resolv_conf",
                "chroot.provision",
            ]
        );
    }
}
