use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

use super::ConfigDoc;
use crate::error::{Error, Result};
use crate::image::ImageType;

const KNOWN_TABLES: [&str; 2] = ["build", "flash"];

pub fn host_is_arm() -> bool {
    matches!(std::env::consts::ARCH, "arm" | "aarch64")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolvConf {
    #[default]
    Off,
    CopyHost,
    BindHost,
    Delete,
}

/// Host filesystem mounted into the chroot: `[type, source, target]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct ChrootMount {
    pub fs_type: String,
    pub source: String,
    pub target: String,
}

impl ChrootMount {
    pub fn new(fs_type: &str, source: &str, target: &str) -> Self {
        Self {
            fs_type: fs_type.into(),
            source: source.into(),
            target: target.into(),
        }
    }

    pub fn is_bind(&self) -> bool {
        self.fs_type == "bind"
    }
}

impl TryFrom<Vec<String>> for ChrootMount {
    type Error = String;

    fn try_from(v: Vec<String>) -> std::result::Result<Self, Self::Error> {
        match <[String; 3]>::try_from(v) {
            Ok([fs_type, source, target]) => Ok(Self {
                fs_type,
                source,
                target,
            }),
            Err(v) => Err(format!(
                "chroot mount must be [type, source, target], got {} element(s)",
                v.len()
            )),
        }
    }
}

impl From<ChrootMount> for Vec<String> {
    fn from(m: ChrootMount) -> Self {
        vec![m.fs_type, m.source, m.target]
    }
}

pub fn default_chroot_mounts() -> Vec<ChrootMount> {
    vec![
        ChrootMount::new("proc", "proc", "/proc"),
        ChrootMount::new("sysfs", "sysfs", "/sys"),
        ChrootMount::new("bind", "/dev", "/dev"),
        ChrootMount::new("devpts", "devpts", "/dev/pts"),
        ChrootMount::new("binfmt_misc", "binfmt_misc", "/proc/sys/fs/binfmt_misc"),
    ]
}

/// Expected digest of the downloaded image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Checksum {
    None,
    Sha256(String),
    Sha512(String),
    /// Checksum list (`<hex>  <file>` lines) at a path or URL.
    File(String),
}

impl FromStr for Checksum {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("none") {
            return Ok(Checksum::None);
        }
        let Some((kind, value)) = s.split_once(':') else {
            return Err(Error::msg(format!(
                "iso_checksum '{s}' must look like sha256:<hex>, sha512:<hex>, file:<path> or none"
            )));
        };
        let hex_of = |len: usize| -> Result<String> {
            let v = value.trim().to_ascii_lowercase();
            if v.len() != len || !v.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(Error::msg(format!(
                    "iso_checksum {kind} value must be {len} hex characters"
                )));
            }
            Ok(v)
        };
        match kind.to_ascii_lowercase().as_str() {
            "sha256" => Ok(Checksum::Sha256(hex_of(64)?)),
            "sha512" => Ok(Checksum::Sha512(hex_of(128)?)),
            "file" if !value.trim().is_empty() => Ok(Checksum::File(value.trim().to_string())),
            _ => Err(Error::msg(format!("unsupported iso_checksum type '{kind}'"))),
        }
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Checksum::None => write!(f, "none"),
            Checksum::Sha256(h) => write!(f, "sha256:{h}"),
            Checksum::Sha512(h) => write!(f, "sha512:{h}"),
            Checksum::File(p) => write!(f, "file:{p}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShellProvisionerConfig {
    pub inline: Vec<String>,
    /// Host script copied into the chroot and executed there.
    pub script: Option<PathBuf>,
    pub environment: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileProvisionerConfig {
    pub source: PathBuf,
    /// Path inside the image.
    pub destination: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProvisionerConfig {
    Shell(ShellProvisionerConfig),
    File(FileProvisionerConfig),
}

/// The `[build]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildConfig {
    pub name: String,
    pub iso_url: Option<String>,
    pub iso_urls: Vec<String>,
    pub iso_checksum: String,
    pub output_filename: Option<PathBuf>,
    pub output_directory: Option<PathBuf>,
    pub image_type: Option<String>,
    pub image_mounts: Vec<String>,
    pub mount_path: Option<PathBuf>,
    pub chroot_mounts: Vec<ChrootMount>,
    pub additional_chroot_mounts: Vec<ChrootMount>,
    #[serde(alias = "resolv-conf")]
    pub resolv_conf: ResolvConf,
    #[serde(deserialize_with = "byte_size")]
    pub last_partition_extra_size: u64,
    #[serde(deserialize_with = "byte_size")]
    pub target_image_size: u64,
    pub qemu_binary: String,
    pub qemu_args: Vec<String>,
    pub command_wrapper: String,
    pub cache_dir: Option<PathBuf>,
    pub lock_file: PathBuf,
    pub provisioners: Vec<ProvisionerConfig>,

    #[serde(skip)]
    kind: Option<ImageType>,
    #[serde(skip)]
    checksum: Option<Checksum>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            iso_url: None,
            iso_urls: Vec::new(),
            iso_checksum: String::new(),
            output_filename: None,
            output_directory: None,
            image_type: None,
            image_mounts: Vec::new(),
            mount_path: None,
            chroot_mounts: Vec::new(),
            additional_chroot_mounts: Vec::new(),
            resolv_conf: ResolvConf::Off,
            last_partition_extra_size: 0,
            target_image_size: 0,
            qemu_binary: "qemu-arm-static".into(),
            qemu_args: Vec::new(),
            command_wrapper: "{command}".into(),
            cache_dir: None,
            lock_file: PathBuf::from("/run/lock/armimg.lock"),
            provisioners: Vec::new(),
            kind: None,
            checksum: None,
        }
    }
}

impl BuildConfig {
    /// Fills in defaults and validates. Every problem is collected into one
    /// `Config` error; otherwise the returned strings are warnings.
    pub fn prepare(&mut self) -> Result<Vec<String>> {
        self.prepare_for_host(!host_is_arm())
    }

    /// `needs_qemu` is false on ARM hosts, which run the image natively.
    pub fn prepare_for_host(&mut self, needs_qemu: bool) -> Result<Vec<String>> {
        let mut errs = Vec::new();
        let mut warnings = Vec::new();

        if self.name.trim().is_empty() {
            self.name = "arm-image".into();
        }

        if let Some(url) = self.iso_url.take() {
            if self.iso_urls.is_empty() {
                self.iso_urls.push(url);
            } else {
                errs.push("only one of iso_url or iso_urls may be set".to_string());
            }
        }
        if self.iso_urls.is_empty() {
            errs.push("one of iso_url or iso_urls must be set".to_string());
        }

        if self.iso_checksum.trim().is_empty() {
            errs.push("iso_checksum is required (use \"none\" to skip verification)".to_string());
        } else {
            match self.iso_checksum.parse::<Checksum>() {
                Ok(c) => self.checksum = Some(c),
                Err(e) => errs.push(e.to_string()),
            }
        }

        if self.output_filename.is_none() {
            self.output_filename = Some(match &self.output_directory {
                Some(dir) => {
                    warnings.push("output_directory is deprecated, use output_filename instead".into());
                    dir.join("image")
                }
                None => PathBuf::from(format!("output-{}/image", self.name)),
            });
        }

        if self.last_partition_extra_size > 0 {
            warnings.push(
                "last_partition_extra_size is deprecated, use target_image_size to grow your image"
                    .into(),
            );
        }

        if self.chroot_mounts.is_empty() {
            self.chroot_mounts = default_chroot_mounts();
        }
        self.chroot_mounts
            .append(&mut self.additional_chroot_mounts);
        if self.resolv_conf == ResolvConf::BindHost {
            self.chroot_mounts.push(ChrootMount::new(
                "bind",
                "/etc/resolv.conf",
                "/etc/resolv.conf",
            ));
        }

        if self.command_wrapper.trim().is_empty() {
            self.command_wrapper = "{command}".into();
        }
        if let Err(e) = crate::executor::CommandWrapper::new(self.command_wrapper.clone()) {
            errs.push(e.to_string());
        }

        self.kind = match self.image_type.as_deref().map(str::trim) {
            None | Some("") => self.iso_urls.first().and_then(|u| ImageType::guess(u)),
            Some(t) => match t.parse::<ImageType>() {
                Ok(k) => Some(k),
                Err(e) => {
                    errs.push(e.to_string());
                    None
                }
            },
        };
        if let Some(kind) = self.kind {
            self.image_type = Some(kind.as_str().to_string());
            if self.image_mounts.is_empty() {
                self.image_mounts = kind.default_mounts();
            }
            if self.qemu_args.is_empty() {
                self.qemu_args = kind.default_qemu_args();
            }
        }
        if self.image_mounts.is_empty() {
            errs.push("no image mounts provided; set image_mounts or image_type".into());
        }
        if !self.image_mounts.is_empty() && self.image_mounts.iter().all(|m| m.is_empty()) {
            warnings.push("every image mount is empty; nothing will be mounted".into());
        }
        for m in &self.image_mounts {
            // Empty keeps the partition in the layout without mounting it.
            if !m.is_empty() && !m.starts_with('/') {
                errs.push(format!("image mount '{m}' must be an absolute path"));
            }
        }

        if self.qemu_binary.trim().is_empty() {
            self.qemu_binary = "qemu-arm-static".into();
        }
        if needs_qemu {
            match which::which(&self.qemu_binary) {
                Ok(path) => {
                    if !path.to_string_lossy().contains("qemu-") {
                        warnings.push(format!(
                            "{} doesn't look like qemu-user",
                            path.display()
                        ));
                    }
                    self.qemu_binary = path.display().to_string();
                }
                Err(_) => errs.push(format!("qemu binary '{}' not found", self.qemu_binary)),
            }
        }

        if self.cache_dir.is_none() {
            self.cache_dir = Some(
                dirs::cache_dir()
                    .map(|d| d.join("armimg"))
                    .unwrap_or_else(|| PathBuf::from(".armimg-cache")),
            );
        }

        for p in &self.provisioners {
            match p {
                ProvisionerConfig::Shell(s) if s.inline.is_empty() && s.script.is_none() => {
                    errs.push("shell provisioner needs inline commands or a script".into());
                }
                ProvisionerConfig::File(f) if !f.destination.is_absolute() => errs.push(format!(
                    "file provisioner destination '{}' must be absolute",
                    f.destination.display()
                )),
                _ => {}
            }
        }

        if !errs.is_empty() {
            return Err(Error::config(errs));
        }
        for w in &warnings {
            tracing::warn!("{w}");
        }
        Ok(warnings)
    }

    /// Known board family, after [`prepare`](Self::prepare).
    pub fn kind(&self) -> Option<ImageType> {
        self.kind
    }

    pub fn checksum(&self) -> &Checksum {
        self.checksum.as_ref().unwrap_or(&Checksum::None)
    }

    pub fn output_path(&self) -> PathBuf {
        self.output_filename
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("output-{}/image", self.name)))
    }

    pub fn cache_dir(&self) -> &Path {
        self.cache_dir
            .as_deref()
            .unwrap_or_else(|| Path::new(".armimg-cache"))
    }

    pub fn wants_resize(&self) -> bool {
        self.last_partition_extra_size > 0 || self.target_image_size > 0
    }
}

/// The `[flash]` table; also filled from `armimg flash` flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FlashConfig {
    /// Flash right after a successful build.
    pub enabled: bool,
    pub image: Option<PathBuf>,
    pub device: Option<String>,
    #[serde(default = "default_true")]
    pub interactive: bool,
    #[serde(default = "default_true")]
    pub verify: bool,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            image: None,
            device: None,
            interactive: true,
            verify: true,
        }
    }
}

fn default_true() -> bool {
    true
}

// Accepts plain byte counts or strings such as "4G" / "512MiB" (binary units).
fn byte_size<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(u64),
        Str(String),
    }
    match Raw::deserialize(d)? {
        Raw::Int(n) => Ok(n),
        Raw::Str(s) => parse_size(&s).map_err(serde::de::Error::custom),
    }
}

pub(crate) fn parse_size(s: &str) -> std::result::Result<u64, String> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (num, unit) = s.split_at(split);
    let n: u64 = num
        .parse()
        .map_err(|_| format!("invalid size '{s}'"))?;
    let shift = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 0,
        "K" | "KB" | "KIB" => 10,
        "M" | "MB" | "MIB" => 20,
        "G" | "GB" | "GIB" => 30,
        "T" | "TB" | "TIB" => 40,
        other => return Err(format!("invalid size unit '{other}' in '{s}'")),
    };
    n.checked_mul(1u64 << shift)
        .ok_or_else(|| format!("size '{s}' is too large"))
}

/// Reads and prepares `[build]`; the build name defaults to the file stem.
pub fn build_config(doc: &ConfigDoc) -> Result<(BuildConfig, Vec<String>)> {
    if let Some(root) = doc.value.as_table() {
        let unknown: Vec<String> = root
            .keys()
            .filter(|k| !KNOWN_TABLES.contains(&k.as_str()))
            .map(|k| format!("unknown top-level table [{k}]"))
            .collect();
        if !unknown.is_empty() {
            return Err(Error::config(unknown));
        }
    }
    let mut cfg: BuildConfig = doc
        .deserialize_path("build")?
        .ok_or_else(|| Error::config(vec![format!("{} has no [build] table", doc.path.display())]))?;
    if cfg.name.trim().is_empty() {
        cfg.name = doc.stem();
    }
    let warnings = cfg.prepare()?;
    Ok((cfg, warnings))
}

pub fn flash_config(doc: &ConfigDoc) -> Result<FlashConfig> {
    Ok(doc.deserialize_path("flash")?.unwrap_or_default())
}
