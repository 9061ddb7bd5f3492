use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom};
use std::path::Path;

use arm_image_builder_macros::Step;

use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::mbr::{Mbr, bytes_to_sectors};
use crate::pipeline::{BuildState, Step};
use crate::progress::human_bytes;
use crate::steps::sh_quote;

/// Bytes to add to an image of `current` bytes. A non-zero `legacy_extra`
/// (`last_partition_extra_size`) wins over `target`.
pub fn extra_bytes(current: u64, legacy_extra: u64, target: u64) -> Result<u64> {
    if legacy_extra > 0 {
        return Ok(legacy_extra);
    }
    if target < current {
        return Err(Error::msg(format!(
            "target_image_size {} is smaller than the image ({}); shrinking is not supported",
            human_bytes(target),
            human_bytes(current)
        )));
    }
    Ok(target - current)
}

/// Grows the image file and its last MBR partition. Returns the bytes added.
pub(crate) fn grow_image(path: &Path, legacy_extra: u64, target: u64) -> Result<u64> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| Error::msg(format!("failed to open {}: {e}", path.display())))?;
    let mut mbr = Mbr::read(&mut file)?;
    mbr.check()?;

    let current = file.metadata()?.len();
    let extra = extra_bytes(current, legacy_extra, target)?;
    if extra == 0 {
        return Ok(0);
    }
    // Sub-sector remainders grow the file but not the partition.
    let sectors = u32::try_from(bytes_to_sectors(extra))
        .map_err(|_| Error::msg(format!("cannot grow a partition by {}", human_bytes(extra))))?;
    let slot = mbr.grow_last_partition(sectors)?;

    file.set_len(current + extra)
        .map_err(|e| Error::msg(format!("failed to extend {}: {e}", path.display())))?;
    file.seek(SeekFrom::Start(0))?;
    mbr.write(&mut file)?;
    file.sync_all()?;
    tracing::info!(partition = slot + 1, sectors, "grew last partition");
    Ok(extra)
}

#[Step(id = "image.resize_partition", label = "Resizing last partition", privileged = false)]
#[derive(Debug, Default)]
pub struct ResizeLastPartitionStep;

impl Step for ResizeLastPartitionStep {
    fn run(&mut self, state: &mut BuildState, ctx: &ExecCtx) -> Result<()> {
        let path = state.image_path()?;
        let added = grow_image(
            path,
            state.config.last_partition_extra_size,
            state.config.target_image_size,
        )?;
        if added == 0 {
            ctx.ui.message("image is already at the requested size");
        } else {
            ctx.ui.message(&format!("added {} to {}", human_bytes(added), path.display()));
        }
        Ok(())
    }
}

/// Checks and grows the filesystem on the last partition to fill it.
#[Step(id = "image.resize_fs", label = "Resizing filesystem", privileged = true)]
#[derive(Debug, Default)]
pub struct ResizeFsStep;

impl Step for ResizeFsStep {
    fn run(&mut self, state: &mut BuildState, ctx: &ExecCtx) -> Result<()> {
        let last = state
            .partitions
            .last()
            .ok_or_else(|| Error::msg("no partitions mapped"))?;
        let dev = sh_quote(last);
        ctx.run_shell(&format!("e2fsck -y -f {dev}"))?;
        ctx.run_shell(&format!("resize2fs {dev}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mbr::SECTOR_SIZE;
    use crate::mbr::tests::sector_with;
    use std::fs;

    fn image_with_mbr(dir: &Path, size: u64) -> std::path::PathBuf {
        let path = dir.join("image");
        let sector = sector_with(&[(0, 0x00, 0x0c, 8192, 8192), (1, 0x00, 0x83, 16384, 16384)]);
        let f = fs::File::create(&path).unwrap();
        f.set_len(size).unwrap();
        drop(f);
        let mut f = OpenOptions::new().write(true).open(&path).unwrap();
        std::io::Write::write_all(&mut f, &sector).unwrap();
        path
    }

    fn last_len(path: &Path) -> u32 {
        let mbr = Mbr::read(fs::File::open(path).unwrap()).unwrap();
        mbr.partitions()[1].lba_len
    }

    #[test]
    fn target_size_grows_file_and_last_partition() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let size = 32768 * SECTOR_SIZE as u64;
        let img = image_with_mbr(tmp.path(), size);

        let added = grow_image(&img, 0, size + (1 << 20)).unwrap();
        assert_eq!(added, 1 << 20);
        assert_eq!(fs::metadata(&img).unwrap().len(), size + (1 << 20));
        assert_eq!(last_len(&img), 16384 + 2048);
    }

    #[test]
    fn unaligned_growth_truncates_to_whole_sectors() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let size = 32768 * SECTOR_SIZE as u64;
        let img = image_with_mbr(tmp.path(), size);

        // 1000 bytes: the file grows by all of it, the partition by one sector.
        grow_image(&img, 1000, 0).unwrap();
        assert_eq!(fs::metadata(&img).unwrap().len(), size + 1000);
        assert_eq!(last_len(&img), 16384 + 1);
    }

    #[test]
    fn shrinking_is_refused_and_equal_is_a_noop() {
        let err = extra_bytes(4096, 0, 1024).unwrap_err().to_string();
        assert!(err.contains("shrinking is not supported"), "unexpected err: {err}");
        assert_eq!(extra_bytes(4096, 0, 4096).unwrap(), 0);
        assert_eq!(extra_bytes(4096, 512, 1024).unwrap(), 512);

        let tmp = tempfile::tempdir().expect("tempdir");
        let size = 32768 * SECTOR_SIZE as u64;
        let img = image_with_mbr(tmp.path(), size);
        assert_eq!(grow_image(&img, 0, size).unwrap(), 0);
        assert_eq!(last_len(&img), 16384);
    }
}
