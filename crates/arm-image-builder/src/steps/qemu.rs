//! User-mode emulation inside the chroot: the qemu binary copied into the
//! image and its binfmt_misc registration on the host.

use std::fmt::Write as _;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

use arm_image_builder_macros::Step;

use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::pipeline::{BuildState, Step};
use crate::steps::in_root;

/// Entry name under `/proc/sys/fs/binfmt_misc`.
pub const BINFMT_NAME: &str = "armimg";

const BINFMT_DIR: &str = "/proc/sys/fs/binfmt_misc";

const ELF_MASK: &str =
    r"\xff\xff\xff\xff\xff\xff\xff\x00\xff\xff\xff\xff\xff\xff\xff\xff\xfe\xff\xff\xff";
const ARM_MAGIC: &str =
    r"\x7f\x45\x4c\x46\x01\x01\x01\x00\x00\x00\x00\x00\x00\x00\x00\x00\x02\x00\x28\x00";
const AARCH64_MAGIC: &str =
    r"\x7f\x45\x4c\x46\x02\x01\x01\x00\x00\x00\x00\x00\x00\x00\x00\x00\x02\x00\xb7\x00";

fn c_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for b in s.bytes() {
        match b {
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            0x20..=0x7e => out.push(b as char),
            _ => {
                let _ = write!(out, "\\{b:03o}");
            }
        }
    }
    out.push('"');
    out
}

/// C source of a static shim that execs `real` with `args` inserted after
/// `argv[0]`. binfmt_misc can't pass interpreter arguments itself.
pub fn wrapper_source(real: &str, args: &[String]) -> String {
    let extra: Vec<String> = args.iter().map(|a| c_string(a)).collect();
    format!(
        r#"#include <stdlib.h>
#include <string.h>
#include <unistd.h>

static char *extra[] = {{ {extra} }};

int main(int argc, char **argv, char **envp) {{
	const int len = sizeof(extra) / sizeof(extra[0]);
	char **qemuargs = malloc(sizeof(char *) * (argc + len + 1));
	if (qemuargs == NULL)
		return 127;
	qemuargs[0] = argv[0];
	memcpy(&qemuargs[1], extra, sizeof(char *) * len);
	memcpy(&qemuargs[1 + len], &argv[1], sizeof(char *) * (argc - 1));
	qemuargs[argc + len] = NULL;
	execve({real}, qemuargs, envp);
	return 127;
}}
"#,
        extra = extra.join(", "),
        real = c_string(real),
    )
}

/// Registration line for `/proc/sys/fs/binfmt_misc/register`.
pub fn binfmt_record(interpreter: &str, aarch64: bool) -> String {
    let magic = if aarch64 { AARCH64_MAGIC } else { ARM_MAGIC };
    format!(":{BINFMT_NAME}:M::{magic}:{ELF_MASK}:{interpreter}:")
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::msg(format!("failed to remove {}: {e}", path.display()))),
    }
}

#[Step(id = "qemu.install", label = "Installing qemu-user-static", privileged = true)]
#[derive(Debug, Default)]
pub struct QemuUserStaticStep {
    installed: Vec<PathBuf>,
}

impl QemuUserStaticStep {
    fn compile_wrapper(
        &mut self,
        ctx: &ExecCtx,
        real_in_chroot: &str,
        args: &[String],
        dest: &Path,
    ) -> Result<()> {
        let gcc = which::which("gcc")
            .map_err(|_| Error::msg("gcc is required to pass qemu_args but was not found"))?;
        let work = tempfile::tempdir()
            .map_err(|e| Error::msg(format!("failed to create temp dir: {e}")))?;
        let src = work.path().join("qemu-wrapper.c");
        fs::write(&src, wrapper_source(real_in_chroot, args))
            .map_err(|e| Error::msg(format!("failed to write {}: {e}", src.display())))?;
        let mut cmd = Command::new(gcc);
        cmd.args(["-g", "-static", "-o"]).arg(dest).arg(&src);
        ctx.run(cmd)?;
        self.installed.push(dest.to_path_buf());
        Ok(())
    }
}

impl Step for QemuUserStaticStep {
    fn run(&mut self, state: &mut BuildState, ctx: &ExecCtx) -> Result<()> {
        let root = state.mount_path()?.to_path_buf();
        let qemu = PathBuf::from(&state.config.qemu_binary);
        let name = qemu
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::msg(format!("bad qemu_binary '{}'", qemu.display())))?
            .to_string();
        let in_chroot = format!("/{name}");
        let dest = in_root(&root, &in_chroot);

        let args = state.config.qemu_args.clone();
        let copy_to = if args.is_empty() {
            dest.clone()
        } else {
            in_root(&root, format!("{in_chroot}-wrapped"))
        };
        fs::copy(&qemu, &copy_to).map_err(|e| {
            Error::msg(format!(
                "failed to copy {} to {}: {e}",
                qemu.display(),
                copy_to.display()
            ))
        })?;
        self.installed.push(copy_to);

        if !args.is_empty() {
            ctx.ui.message(&format!("wrapping {name} with {}", args.join(" ")));
            self.compile_wrapper(ctx, &format!("{in_chroot}-wrapped"), &args, &dest)?;
        }
        state.qemu_in_chroot = Some(PathBuf::from(in_chroot));
        Ok(())
    }

    fn cleanup(&mut self, state: &mut BuildState, _ctx: &ExecCtx) -> Result<()> {
        let mut first_err = None;
        for path in self.installed.drain(..).rev() {
            if let Err(e) = remove_if_present(&path) {
                first_err.get_or_insert(e);
            }
        }
        state.qemu_in_chroot = None;
        first_err.map_or(Ok(()), Err)
    }
}

/// Registers the emulator with binfmt_misc so foreign ELF binaries run
/// transparently inside the chroot.
#[Step(id = "qemu.binfmt", label = "Registering binfmt_misc handler", privileged = true)]
#[derive(Debug)]
pub struct RegisterBinfmtStep {
    pub binfmt_dir: PathBuf,
    registered: bool,
}

impl Default for RegisterBinfmtStep {
    fn default() -> Self {
        Self {
            binfmt_dir: PathBuf::from(BINFMT_DIR),
            registered: false,
        }
    }
}

impl RegisterBinfmtStep {
    fn entry(&self) -> PathBuf {
        self.binfmt_dir.join(BINFMT_NAME)
    }

    fn deregister(&self) -> Result<()> {
        let entry = self.entry();
        let mut f = OpenOptions::new()
            .write(true)
            .open(&entry)
            .map_err(|e| Error::msg(format!("failed to open {}: {e}", entry.display())))?;
        f.write_all(b"-1\n")
            .map_err(|e| Error::msg(format!("failed to deregister {BINFMT_NAME}: {e}")))
    }
}

impl Step for RegisterBinfmtStep {
    fn run(&mut self, state: &mut BuildState, ctx: &ExecCtx) -> Result<()> {
        let interp = state
            .qemu_in_chroot
            .as_deref()
            .ok_or_else(|| Error::msg("qemu is not installed in the image"))?
            .display()
            .to_string();
        let aarch64 = interp.contains("64");

        if self.entry().exists() {
            tracing::warn!("replacing stale binfmt_misc entry {BINFMT_NAME}");
            self.deregister()?;
        }

        let register = self.binfmt_dir.join("register");
        let mut f = OpenOptions::new().write(true).open(&register).map_err(|e| {
            Error::msg(format!(
                "cannot open {}: {e} (is binfmt_misc mounted and are you root?)",
                register.display()
            ))
        })?;
        f.write_all(binfmt_record(&interp, aarch64).as_bytes())
            .map_err(|e| Error::msg(format!("binfmt_misc registration failed: {e}")))?;
        drop(f);

        if !self.entry().exists() {
            return Err(Error::msg(format!(
                "binfmt_misc entry {} did not appear after registration",
                self.entry().display()
            )));
        }
        self.registered = true;
        ctx.ui.message(&format!("registered {interp} for {} binaries", if aarch64 { "aarch64" } else { "arm" }));
        Ok(())
    }

    fn cleanup(&mut self, _state: &mut BuildState, _ctx: &ExecCtx) -> Result<()> {
        if !std::mem::take(&mut self.registered) {
            return Ok(());
        }
        self.deregister()
    }
}
