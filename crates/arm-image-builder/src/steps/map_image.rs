use std::fs;
use std::path::Path;
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

use arm_image_builder_macros::Step;
use regex::Regex;

use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::pipeline::{BuildState, Step};

const PARTITION_SCAN_TIMEOUT: Duration = Duration::from_secs(1);
const PARTITION_SCAN_POLL: Duration = Duration::from_millis(50);

/// Attaches the working image to a loop device with partition scanning.
#[Step(id = "image.map", label = "Mapping image partitions", privileged = true)]
#[derive(Debug, Default)]
pub struct MapImageStep {
    loop_device: Option<String>,
}

impl Step for MapImageStep {
    fn run(&mut self, state: &mut BuildState, ctx: &ExecCtx) -> Result<()> {
        let image = state.image_path()?;
        let mut cmd = Command::new("losetup");
        cmd.args(["--show", "-f", "-P"]).arg(image);
        let out = ctx.output(cmd)?;
        let dev = out.trim().to_string();
        if loop_device_of(&dev).as_deref() != Some(dev.as_str()) {
            return Err(Error::msg(format!("unexpected losetup output '{dev}'")));
        }
        self.loop_device = Some(dev.clone());
        ctx.ui.message(&format!("attached {} to {dev}", image.display()));

        let name = dev.trim_start_matches("/dev/");
        let started = Instant::now();
        let parts = loop {
            let found = partitions_in(Path::new("/dev"), name)?;
            if !found.is_empty() {
                break found;
            }
            if started.elapsed() >= PARTITION_SCAN_TIMEOUT {
                return Err(Error::msg(format!("no partitions appeared on {dev}")));
            }
            thread::sleep(PARTITION_SCAN_POLL);
        };
        let parts = sort_partitions(parts);
        tracing::info!(device = %dev, partitions = ?parts, "image mapped");
        state.partitions = parts;
        Ok(())
    }

    fn cleanup(&mut self, state: &mut BuildState, ctx: &ExecCtx) -> Result<()> {
        let dev = self
            .loop_device
            .take()
            .or_else(|| state.partitions.first().and_then(|p| loop_device_of(p)));
        state.partitions.clear();
        let Some(dev) = dev else {
            return Ok(());
        };
        let mut cmd = Command::new("losetup");
        cmd.arg("-d").arg(&dev);
        ctx.run(cmd)
    }
}

/// Partition device nodes of loop device `name` (e.g. `loop3`) found in `dev_dir`.
fn partitions_in(dev_dir: &Path, name: &str) -> Result<Vec<String>> {
    let prefix = format!("{name}p");
    let entries = fs::read_dir(dev_dir)
        .map_err(|e| Error::msg(format!("failed to list {}: {e}", dev_dir.display())))?;
    let mut out = Vec::new();
    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        let Some(num) = file_name.strip_prefix(&prefix) else {
            continue;
        };
        if !num.is_empty() && num.chars().all(|c| c.is_ascii_digit()) {
            out.push(dev_dir.join(file_name).display().to_string());
        }
    }
    Ok(out)
}

fn partition_number(part: &str) -> u32 {
    let digits: String = part
        .chars()
        .rev()
        .take_while(char::is_ascii_digit)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    digits.parse().unwrap_or(0)
}

/// Orders partition devices by their trailing partition number, so
/// `loop10p2` comes before `loop10p10`.
pub fn sort_partitions(mut parts: Vec<String>) -> Vec<String> {
    parts.sort_by_key(|p| partition_number(p));
    parts
}

/// `/dev/loop3p2` -> `/dev/loop3`.
pub fn loop_device_of(part: &str) -> Option<String> {
    let re = Regex::new(r"^/dev/loop[0-9]+").ok()?;
    re.find(part).map(|m| m.as_str().to_string())
}
