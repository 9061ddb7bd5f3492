use std::fs;
use std::io;
use std::path::PathBuf;

use arm_image_builder_macros::Step;

use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::pipeline::{BuildState, Step};
use crate::steps::{in_root, sh_path, sh_quote};

/// Pairs each partition with its mountpoint, ordered so parents are mounted
/// before the directories nested in them (`/` sorts before `/boot`).
///
/// An empty mountpoint counts towards the layout check but the partition is
/// left unmounted (swap, data partitions).
pub fn mount_plan(partitions: &[String], mounts: &[String]) -> Result<Vec<(String, String)>> {
    if partitions.len() != mounts.len() {
        return Err(Error::msg(format!(
            "image layout does not match configuration: {} partition(s) but {} image_mounts",
            partitions.len(),
            mounts.len()
        )));
    }
    let mut plan: Vec<(String, String)> = partitions
        .iter()
        .cloned()
        .zip(mounts.iter().cloned())
        .filter(|(_, mountpoint)| !mountpoint.is_empty())
        .collect();
    plan.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(plan)
}

#[Step(id = "image.mount", label = "Mounting image partitions", privileged = true)]
#[derive(Debug, Default)]
pub struct MountImageStep {
    root: Option<PathBuf>,
    mounted: Vec<PathBuf>,
}

impl Step for MountImageStep {
    fn run(&mut self, state: &mut BuildState, ctx: &ExecCtx) -> Result<()> {
        let plan = mount_plan(&state.partitions, &state.config.image_mounts)?;

        let root = match &state.config.mount_path {
            Some(p) => {
                fs::create_dir_all(p)
                    .map_err(|e| Error::msg(format!("failed to create {}: {e}", p.display())))?;
                p.clone()
            }
            None => tempfile::Builder::new()
                .prefix("armimg-")
                .tempdir()
                .map_err(|e| Error::msg(format!("failed to create mount root: {e}")))?
                .keep(),
        };
        self.root = Some(root.clone());

        for (part, mountpoint) in &plan {
            ctx.check_cancelled()?;
            let target = in_root(&root, mountpoint);
            fs::create_dir_all(&target)
                .map_err(|e| Error::msg(format!("failed to create {}: {e}", target.display())))?;
            ctx.run_shell(&format!("mount {} {}", sh_quote(part), sh_path(&target)))?;
            tracing::debug!(partition = %part, target = %target.display(), "mounted");
            self.mounted.push(target);
        }

        ctx.ui.message(&format!("image mounted at {}", root.display()));
        state
            .generated_data
            .insert("MountPath".into(), root.display().to_string());
        state.mount_path = Some(root);
        Ok(())
    }

    fn cleanup(&mut self, state: &mut BuildState, ctx: &ExecCtx) -> Result<()> {
        let mut failed = Vec::new();
        while let Some(target) = self.mounted.pop() {
            if let Err(e) = ctx.run_shell(&format!("umount {}", sh_path(&target))) {
                failed.push(e.to_string());
            }
        }
        if !failed.is_empty() {
            // Leave the root alone; something is still mounted under it.
            return Err(Error::msg(failed.join("; ")));
        }
        state.mount_path = None;
        if let Some(root) = self.root.take() {
            match fs::remove_dir(&root) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(Error::msg(format!(
                        "failed to remove {}: {e}",
                        root.display()
                    )));
                }
            }
        }
        Ok(())
    }
}
