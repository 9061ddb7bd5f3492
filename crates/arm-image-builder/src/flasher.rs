//! Writes a finished image onto removable media and reads it back to verify.

use std::fs::{self, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, SystemTime};

use sha2::{Digest, Sha256};

use crate::config::FlashConfig;
use crate::devices::{Device, DeviceInventory, SystemInventory};
use crate::error::{Error, Result};
use crate::image::{ImageOpener, looks_like_image};
use crate::progress::{copy_with_progress, human_bytes};
use crate::ui::Ui;

const REPORT_EVERY: Duration = Duration::from_secs(2);

/// Raw access to a target device.
pub trait DeviceIo: Send + Sync {
    fn open_write(&self, device: &str) -> Result<Box<dyn Write + Send>>;
    fn open_read(&self, device: &str) -> Result<Box<dyn Read + Send>>;
    fn unmount(&self, mountpoint: &str) -> Result<()>;
    fn sync(&self);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDeviceIo;

impl DeviceIo for SystemDeviceIo {
    fn open_write(&self, device: &str) -> Result<Box<dyn Write + Send>> {
        let f = OpenOptions::new()
            .write(true)
            .open(device)
            .map_err(|e| Error::msg(format!("failed to open {device} for writing: {e}")))?;
        Ok(Box::new(f))
    }

    fn open_read(&self, device: &str) -> Result<Box<dyn Read + Send>> {
        let f = fs::File::open(device)
            .map_err(|e| Error::msg(format!("failed to open {device} for reading: {e}")))?;
        Ok(Box::new(f))
    }

    fn unmount(&self, mountpoint: &str) -> Result<()> {
        let out = Command::new("umount")
            .arg(mountpoint)
            .output()
            .map_err(|e| Error::msg(format!("failed to run umount: {e}")))?;
        if !out.status.success() {
            return Err(Error::msg(format!(
                "failed to unmount {mountpoint}: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        Ok(())
    }

    fn sync(&self) {
        unsafe { libc::sync() };
    }
}

/// Sha256 of everything written through it.
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    pub fn finish(self) -> (W, String) {
        (self.inner, hex::encode(self.hasher.finalize()))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashReport {
    pub image: PathBuf,
    pub device: String,
    pub bytes_written: u64,
    pub sha256: String,
}

pub struct Flasher {
    config: FlashConfig,
    ui: Arc<dyn Ui>,
    inventory: Box<dyn DeviceInventory>,
    io: Box<dyn DeviceIo>,
    search_dir: PathBuf,
    cancel: Arc<AtomicBool>,
    opener: ImageOpener,
}

impl Flasher {
    pub fn new(config: FlashConfig, ui: Arc<dyn Ui>) -> Self {
        Self {
            config,
            ui,
            inventory: Box::new(SystemInventory),
            io: Box::new(SystemDeviceIo),
            search_dir: PathBuf::from("."),
            cancel: Arc::new(AtomicBool::new(false)),
            opener: ImageOpener::default(),
        }
    }

    pub fn with_inventory(mut self, inventory: Box<dyn DeviceInventory>) -> Self {
        self.inventory = inventory;
        self
    }

    pub fn with_io(mut self, io: Box<dyn DeviceIo>) -> Self {
        self.io = io;
        self
    }

    /// Directory searched for images when none is configured.
    pub fn with_search_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.search_dir = dir.into();
        self
    }

    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_opener(mut self, opener: ImageOpener) -> Self {
        self.opener = opener;
        self
    }

    pub fn flash(&self) -> Result<FlashReport> {
        if unsafe { libc::geteuid() } != 0 {
            tracing::warn!("not running as root; opening the device will probably fail");
            self.ui
                .error("not running as root; opening the device will probably fail");
        }

        let image = self.resolve_image()?;
        let device = self.resolve_device()?;
        if self.config.interactive {
            self.confirm(&image, &device)?;
        }

        for mp in &device.mountpoints {
            self.ui.message(&format!("unmounting {mp}"));
            self.io.unmount(mp)?;
        }

        self.ui.say(&format!("Writing {} to {}", image.display(), device.path));
        let source = self.opener.open(&image)?;
        let total = source.size_estimate();
        let target = HashingWriter::new(self.io.open_write(&device.path)?);
        let ui = self.ui.clone();
        let (written, target) =
            copy_with_progress(source, target, total, &self.cancel, REPORT_EVERY, |s| {
                ui.message(&format!("flashed {s}"))
            })?;
        let (mut dev, sha256) = target.finish();
        dev.flush()?;
        drop(dev);
        self.io.sync();
        self.ui
            .message(&format!("wrote {} (sha256 {sha256})", human_bytes(written)));

        if self.config.verify {
            self.ui.say("Verifying");
            let reader = self.io.open_read(&device.path)?;
            let mut check = HashingWriter::new(io::sink());
            let read = io::copy(&mut reader.take(written), &mut check)
                .map_err(|e| Error::msg(format!("failed to read back {}: {e}", device.path)))?;
            let (_, readback) = check.finish();
            if read != written || readback != sha256 {
                tracing::warn!(%sha256, %readback, read, written, "verification mismatch");
                return Err(Error::msg("checksums different - validation failed"));
            }
            self.ui.message("verification ok");
        }

        Ok(FlashReport {
            image,
            device: device.path,
            bytes_written: written,
            sha256,
        })
    }

    fn resolve_image(&self) -> Result<PathBuf> {
        if let Some(p) = &self.config.image {
            if !p.is_file() {
                return Err(Error::msg(format!("image {} does not exist", p.display())));
            }
            return Ok(p.clone());
        }
        let candidates = find_images(&self.search_dir)?;
        if candidates.is_empty() {
            return Err(Error::msg(format!(
                "no image found in {}; pass --image",
                self.search_dir.display()
            )));
        }
        if !self.config.interactive || candidates.len() == 1 {
            return Ok(candidates[0].0.clone());
        }
        self.ui.say("Select an image to flash");
        for (i, (path, mtime)) in candidates.iter().enumerate() {
            let when = chrono::DateTime::<chrono::Local>::from(*mtime).format("%Y-%m-%d %H:%M");
            self.ui.message(&format!("{}) {} ({when})", i + 1, path.display()));
        }
        let idx = pick(self.ui.as_ref(), candidates.len())?;
        Ok(candidates[idx].0.clone())
    }

    fn resolve_device(&self) -> Result<Device> {
        let devices = self.inventory.removable_devices()?;
        if let Some(want) = &self.config.device {
            let mut matching: Vec<Device> = devices
                .into_iter()
                .filter(|d| d.path == *want || d.path.rsplit('/').next() == Some(want.as_str()))
                .collect();
            if matching.len() != 1 {
                return Err(Error::msg(format!("configured device {want} not found")));
            }
            return Ok(matching.remove(0));
        }
        if !self.config.interactive {
            if devices.len() != 1 {
                return Err(Error::msg(format!(
                    "ambiguous device: {} removable device(s) found; pass --device",
                    devices.len()
                )));
            }
            return devices
                .into_iter()
                .next()
                .ok_or_else(|| Error::msg("ambiguous device"));
        }
        if devices.is_empty() {
            return Err(Error::msg("no removable devices found"));
        }
        self.ui.say("Select a device to flash");
        for (i, d) in devices.iter().enumerate() {
            self.ui.message(&format!(
                "{}) {} {} ({})",
                i + 1,
                d.path,
                d.name,
                human_bytes(d.size)
            ));
        }
        let idx = pick(self.ui.as_ref(), devices.len())?;
        devices
            .into_iter()
            .nth(idx)
            .ok_or_else(|| Error::msg("invalid device selection"))
    }

    fn confirm(&self, image: &Path, device: &Device) -> Result<()> {
        let answer = self.ui.ask(&format!(
            "All data on {} ({}) will be replaced by {}. Type 'yes' to continue:",
            device.path,
            human_bytes(device.size),
            image.display()
        ))?;
        if !answer.trim().to_lowercase().starts_with("yes") {
            return Err(Error::declined("canceled by user"));
        }
        Ok(())
    }
}

// 1-based numbered choice; empty answer takes the first entry.
fn pick(ui: &dyn Ui, count: usize) -> Result<usize> {
    let answer = ui.ask(&format!("Choice [1-{count}, default 1]:"))?;
    let answer = answer.trim();
    if answer.is_empty() {
        return Ok(0);
    }
    match answer.parse::<usize>() {
        Ok(n) if (1..=count).contains(&n) => Ok(n - 1),
        _ => Err(Error::msg(format!("invalid choice '{answer}'"))),
    }
}

/// Image files in `dir` and its `output-*` directories, newest first.
pub fn find_images(dir: &Path) -> Result<Vec<(PathBuf, SystemTime)>> {
    let mut out = Vec::new();
    let mut scan = |d: &Path| -> Result<()> {
        let entries = fs::read_dir(d)
            .map_err(|e| Error::msg(format!("failed to list {}: {e}", d.display())))?;
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            let name = entry.file_name().to_string_lossy().to_string();
            if meta.is_file() && looks_like_image(&name) {
                out.push((path, meta.modified().unwrap_or(SystemTime::UNIX_EPOCH)));
            }
        }
        Ok(())
    };
    scan(dir)?;
    let mut output_dirs: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|e| Error::msg(format!("failed to list {}: {e}", dir.display())))?
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().starts_with("output-"))
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    output_dirs.sort();
    for d in output_dirs {
        scan(&d)?;
    }
    out.sort_by(|a, b| b.1.cmp(&a.1));
    Ok(out)
}
