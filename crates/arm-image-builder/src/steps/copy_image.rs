use std::fs;
use std::time::Duration;

use arm_image_builder_macros::Step;

use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::image::ImageOpener;
use crate::pipeline::{BuildState, Step};
use crate::progress::copy_with_progress;

const REPORT_EVERY: Duration = Duration::from_secs(5);

/// Decompresses the source image into `output_filename`, replacing whatever a
/// previous run left there.
#[Step(id = "image.copy", label = "Copying source image", privileged = false)]
#[derive(Debug, Default)]
pub struct CopyImageStep {
    pub opener: ImageOpener,
}

impl Step for CopyImageStep {
    fn run(&mut self, state: &mut BuildState, ctx: &ExecCtx) -> Result<()> {
        let src = state.iso_path()?.to_path_buf();
        let dst = state.config.output_path();
        if let (Ok(a), Ok(b)) = (fs::canonicalize(&src), fs::canonicalize(&dst)) {
            if a == b {
                return Err(Error::msg(format!(
                    "output_filename {} is the source image itself",
                    dst.display()
                )));
            }
        }
        if let Some(parent) = dst.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| Error::msg(format!("failed to create {}: {e}", parent.display())))?;
        }

        let image = self.opener.open(&src)?;
        ctx.ui.message(&format!(
            "{} image {} -> {}",
            image.container(),
            src.display(),
            dst.display()
        ));
        let total = image.size_estimate();
        let out = fs::File::create(&dst)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", dst.display())))?;
        // Set before copying so a partial image is still left for the caller to inspect.
        state.image_path = Some(dst.clone());

        let ui = ctx.ui.clone();
        let (n, out) = copy_with_progress(image, out, total, &ctx.cancel, REPORT_EVERY, |s| {
            ui.message(&format!("copied {s}"))
        })?;
        out.sync_all()
            .map_err(|e| Error::msg(format!("failed to sync {}: {e}", dst.display())))?;
        tracing::info!(bytes = n, image = %dst.display(), "image copied");
        Ok(())
    }
}
