//! Block device discovery for the flasher: `lsblk`, `/proc/mounts` and `udevadm`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::process::Command;

use serde::{Deserialize, Deserializer};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub path: String,
    pub name: String,
    pub removable: bool,
    pub read_only: bool,
    pub size: u64,
    /// Mountpoints of the device and all of its partitions.
    pub mountpoints: Vec<String>,
}

/// Source of candidate devices for flashing.
pub trait DeviceInventory {
    fn devices(&self) -> Result<Vec<Device>>;

    fn removable_devices(&self) -> Result<Vec<Device>> {
        Ok(self
            .devices()?
            .into_iter()
            .filter(|d| d.removable && !d.read_only)
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub device: String,
    pub mountpoint: String,
    pub fs_type: String,
    pub options: String,
}

#[derive(Debug, Clone, Default)]
pub struct MountTable {
    pub entries: Vec<MountEntry>,
}

impl MountTable {
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("/proc/mounts"))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .map_err(|e| Error::msg(format!("failed to read {}: {e}", path.display())))?;
        Self::parse(&data)
    }

    pub fn parse(data: &str) -> Result<Self> {
        let mut entries = Vec::new();
        for (idx, line) in data.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split(' ').collect();
            if fields.len() < 4 {
                return Err(Error::msg(format!(
                    "unexpected mount table format on line {}: {line}",
                    idx + 1
                )));
            }
            entries.push(MountEntry {
                device: unescape_octal(fields[0]),
                mountpoint: unescape_octal(fields[1]),
                fs_type: fields[2].to_string(),
                options: fields[3].to_string(),
            });
        }
        Ok(Self { entries })
    }

    /// Mountpoints whose source is `device_path` or its `/dev/disk/by-uuid` alias.
    pub fn mountpoints_of(&self, device_path: &str, uuid: Option<&str>) -> Vec<String> {
        let by_uuid = uuid
            .filter(|u| !u.is_empty())
            .map(|u| format!("/dev/disk/by-uuid/{u}"));
        self.entries
            .iter()
            .filter(|e| e.device == device_path || by_uuid.as_deref() == Some(e.device.as_str()))
            .map(|e| e.mountpoint.clone())
            .collect()
    }
}

// The kernel escapes space, tab, newline and backslash as `\ooo`.
fn unescape_octal(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let v = digits
                    .iter()
                    .fold(0u32, |acc, d| acc * 8 + (d - b'0') as u32);
                if v <= 0xff {
                    out.push(v as u8);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// `udevadm info --query=property` output.
#[derive(Debug, Clone, Default)]
pub struct UdevInfo {
    pub values: BTreeMap<String, String>,
}

impl UdevInfo {
    pub fn query(device_path: &str) -> Result<Self> {
        let out = Command::new("udevadm")
            .arg("info")
            .arg("--query=property")
            .arg(format!("--name={device_path}"))
            .output()
            .map_err(|e| Error::msg(format!("failed to run udevadm: {e}")))?;
        if !out.status.success() {
            return Err(Error::msg(format!(
                "udevadm info for {device_path} failed ({})",
                out.status
            )));
        }
        Self::parse(&String::from_utf8_lossy(&out.stdout))
    }

    pub fn parse(data: &str) -> Result<Self> {
        let mut values = BTreeMap::new();
        for line in data.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some((k, v)) = line.split_once('=') else {
                return Err(Error::msg(format!("unexpected udevadm output: {line}")));
            };
            values.insert(k.to_string(), v.to_string());
        }
        Ok(Self { values })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    fn is_sd_flash(&self) -> bool {
        self.get("ID_DRIVE_FLASH_SD") == Some("1") || self.get("ID_DRIVE_MEDIA_FLASH_SD") == Some("1")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LsblkDevice {
    pub name: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default, deserialize_with = "string_or_int")]
    pub size: u64,
    #[serde(default, deserialize_with = "string_or_bool")]
    pub ro: bool,
    #[serde(default, deserialize_with = "string_or_bool")]
    pub rm: bool,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub children: Vec<LsblkDevice>,
}

impl LsblkDevice {
    pub fn device_path(&self) -> String {
        format!("/dev/{}", self.name)
    }
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkDevice>,
}

// Older util-linux prints "0"/"1" strings where newer versions print JSON bools.
fn string_or_bool<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bool(bool),
        Str(String),
        Null,
    }
    Ok(match Raw::deserialize(d)? {
        Raw::Bool(b) => b,
        Raw::Str(s) => s == "1" || s.eq_ignore_ascii_case("true"),
        Raw::Null => false,
    })
}

fn string_or_int<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(u64),
        Str(String),
        Null,
    }
    match Raw::deserialize(d)? {
        Raw::Int(n) => Ok(n),
        Raw::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
        Raw::Null => Ok(0),
    }
}

pub fn parse_lsblk(json: &str) -> Result<Vec<LsblkDevice>> {
    let out: LsblkOutput = serde_json::from_str(json)?;
    Ok(out.blockdevices)
}

/// Joins lsblk records with the mount table and udev properties.
pub fn describe_devices<U>(
    lsblk: &[LsblkDevice],
    mounts: &MountTable,
    mut udev: U,
) -> Result<Vec<Device>>
where
    U: FnMut(&str) -> Result<UdevInfo>,
{
    let mut out = Vec::with_capacity(lsblk.len());
    for dev in lsblk {
        let path = dev.device_path();
        let mut mountpoints = Vec::new();
        collect_mountpoints(dev, mounts, &mut mountpoints);

        let mut info: Option<UdevInfo> = None;
        let removable = if dev.rm {
            true
        } else {
            let i = udev(&path)?;
            let sd = i.is_sd_flash();
            info = Some(i);
            sd
        };
        let mut name = dev.model.clone().unwrap_or_default().trim().to_string();
        if name.is_empty() {
            let i = match info.take() {
                Some(i) => i,
                None => udev(&path)?,
            };
            name = i.get("ID_NAME").unwrap_or_default().to_string();
        }

        out.push(Device {
            path,
            name,
            removable,
            read_only: dev.ro,
            size: dev.size,
            mountpoints,
        });
    }
    Ok(out)
}

fn collect_mountpoints(dev: &LsblkDevice, mounts: &MountTable, acc: &mut Vec<String>) {
    acc.extend(mounts.mountpoints_of(&dev.device_path(), dev.uuid.as_deref()));
    for child in &dev.children {
        collect_mountpoints(child, mounts, acc);
    }
}

/// Inventory backed by the running system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemInventory;

impl DeviceInventory for SystemInventory {
    fn devices(&self) -> Result<Vec<Device>> {
        let out = Command::new("lsblk")
            .args(["-b", "--output", "NAME,SIZE,RO,RM,MODEL,UUID", "--json"])
            .output()
            .map_err(|e| Error::msg(format!("failed to run lsblk: {e}")))?;
        if !out.status.success() {
            return Err(Error::msg(format!("lsblk failed ({})", out.status)));
        }
        let lsblk = parse_lsblk(&String::from_utf8_lossy(&out.stdout))?;
        let mounts = MountTable::load()?;
        describe_devices(&lsblk, &mounts, UdevInfo::query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LSBLK_OLD: &str = r#"{
   "blockdevices": [
      {"name": "sda", "size": "500107862016", "ro": "0", "rm": "0", "model": "Samsung SSD 860 ", "uuid": null,
         "children": [
            {"name": "sda1", "size": "536870912", "ro": "0", "rm": "0", "model": null, "uuid": "7A3B-1C2D"},
            {"name": "sda2", "size": "499570991104", "ro": "0", "rm": "0", "model": null, "uuid": "0f1e2d3c"}
         ]
      },
      {"name": "mmcblk0", "size": "31914983424", "ro": "0", "rm": "0", "model": null, "uuid": null,
         "children": [
            {"name": "mmcblk0p1", "size": "268435456", "ro": "0", "rm": "0", "model": null, "uuid": "B1C2-D3E4"}
         ]
      }
   ]
}"#;

    const LSBLK_NEW: &str = r#"{"blockdevices": [
        {"name": "sdb", "size": 15931539456, "ro": false, "rm": true, "model": "Cruzer Blade", "uuid": null}
    ]}"#;

    const MOUNTS: &str = "\
/dev/sda2 / ext4 rw,relatime 0 0
/dev/disk/by-uuid/7A3B-1C2D /boot/efi vfat rw 0 0
proc /proc proc rw,nosuid 0 0
/dev/mmcblk0p1 /media/user/boot\\040part vfat rw 0 0
";

    fn udev_stub(path: &str) -> Result<UdevInfo> {
        match path {
            "/dev/mmcblk0" => UdevInfo::parse("ID_NAME=SD32G\nID_DRIVE_FLASH_SD=1\n"),
            _ => UdevInfo::parse("ID_NAME=generic\n"),
        }
    }

    #[test]
    fn mount_table_unescapes_octal() {
        let mt = MountTable::parse(MOUNTS).unwrap();
        assert_eq!(mt.entries.len(), 4);
        assert_eq!(mt.entries[3].mountpoint, "/media/user/boot part");
        assert!(mt.entries.iter().any(|e| e.mountpoint == "/proc"));
        assert!(!mt.entries.iter().any(|e| e.mountpoint == "/mnt"));
    }

    #[test]
    fn short_mount_line_is_an_error() {
        assert!(MountTable::parse("/dev/sda1 /boot\n").is_err());
    }

    #[test]
    fn udevadm_lines_split_on_first_equals() {
        let info = UdevInfo::parse("DEVLINKS=/dev/disk/by-id/a=b\nID_NAME=SD\n").unwrap();
        assert_eq!(info.get("DEVLINKS"), Some("/dev/disk/by-id/a=b"));
        assert!(UdevInfo::parse("garbage").is_err());
    }

    #[test]
    fn joins_lsblk_mounts_and_udev() {
        let mt = MountTable::parse(MOUNTS).unwrap();
        let devs = describe_devices(&parse_lsblk(LSBLK_OLD).unwrap(), &mt, udev_stub).unwrap();
        assert_eq!(devs.len(), 2);

        let ssd = &devs[0];
        assert_eq!(ssd.path, "/dev/sda");
        assert_eq!(ssd.name, "Samsung SSD 860");
        assert!(!ssd.removable);
        assert_eq!(ssd.mountpoints, vec!["/boot/efi", "/"]);

        let sd = &devs[1];
        assert!(sd.removable, "SD reader flagged by udev");
        assert_eq!(sd.name, "SD32G");
        assert_eq!(sd.size, 31914983424);
        assert_eq!(sd.mountpoints, vec!["/media/user/boot part"]);
    }

    #[test]
    fn accepts_json_bools_and_ints() {
        let devs = describe_devices(
            &parse_lsblk(LSBLK_NEW).unwrap(),
            &MountTable::default(),
            |_| Err(Error::msg("udev not needed")),
        )
        .unwrap();
        assert_eq!(devs[0].name, "Cruzer Blade");
        assert!(devs[0].removable);
        assert_eq!(devs[0].size, 15931539456);
    }
}
