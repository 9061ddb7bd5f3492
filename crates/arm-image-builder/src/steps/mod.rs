//! The build steps, in the order [`crate::builder::Builder`] wires them up.

mod copy_image;
mod download;
mod host_lock;
mod map_image;
mod mount_extra;
mod mount_image;
mod provision;
mod qemu;
mod resize;
mod resolv_conf;

use std::path::{Component, Path, PathBuf};

pub use copy_image::CopyImageStep;
pub use download::{DownloadStep, find_in_checksum_list};
pub use host_lock::HostLockStep;
pub use map_image::{MapImageStep, loop_device_of, sort_partitions};
pub use mount_extra::{MountCleanupStep, MountExtraStep};
pub use mount_image::{MountImageStep, mount_plan};
pub use provision::{
    ChrootCommunicator, Communicator, ProvisionHook, ProvisionStep, ShellProvisioner,
};
pub use qemu::{BINFMT_NAME, QemuUserStaticStep, RegisterBinfmtStep, binfmt_record, wrapper_source};
pub use resize::{ResizeFsStep, ResizeLastPartitionStep, extra_bytes};
pub use resolv_conf::ResolvConfStep;

pub(crate) fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

pub(crate) fn sh_path(p: &Path) -> String {
    sh_quote(&p.to_string_lossy())
}

/// Maps an absolute path inside the image onto the host under `root`.
/// `..` components are dropped so the result never leaves `root`.
pub fn in_root(root: &Path, inner: impl AsRef<Path>) -> PathBuf {
    let mut out = root.to_path_buf();
    for c in inner.as_ref().components() {
        if let Component::Normal(seg) = c {
            out.push(seg);
        }
    }
    out
}
