use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Board families with a known partition layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageType {
    RaspberryPi,
    BeagleBone,
    Kali,
    Ubuntu,
}

impl ImageType {
    pub const ALL: [ImageType; 4] = [
        ImageType::RaspberryPi,
        ImageType::BeagleBone,
        ImageType::Kali,
        ImageType::Ubuntu,
    ];

    /// Guesses the family from a download URL or file name.
    pub fn guess(name: &str) -> Option<Self> {
        let name = name.to_ascii_lowercase();
        if name.contains("raspbian") || name.contains("raspios") {
            return Some(ImageType::RaspberryPi);
        }
        if name.contains("bone") {
            return Some(ImageType::BeagleBone);
        }
        if name.contains("kali") {
            return Some(ImageType::Kali);
        }
        if name.contains("ubuntu") {
            return Some(ImageType::Ubuntu);
        }
        None
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ImageType::RaspberryPi => "raspberrypi",
            ImageType::BeagleBone => "beaglebone",
            ImageType::Kali => "kali",
            ImageType::Ubuntu => "ubuntu",
        }
    }

    /// Mountpoint of each partition, in partition-table order.
    pub fn default_mounts(self) -> Vec<String> {
        let mounts: &[&str] = match self {
            ImageType::RaspberryPi => &["/boot", "/"],
            ImageType::BeagleBone => &["/"],
            ImageType::Kali => &["/root", "/"],
            ImageType::Ubuntu => &["/boot/firmware", "/"],
        };
        mounts.iter().map(|s| s.to_string()).collect()
    }

    pub fn default_qemu_args(self) -> Vec<String> {
        match self {
            ImageType::BeagleBone => vec!["-cpu".into(), "cortex-a8".into()],
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for ImageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ImageType::ALL
            .into_iter()
            .find(|t| t.as_str() == s.trim())
            .ok_or_else(|| {
                let known: Vec<&str> = ImageType::ALL.iter().map(|t| t.as_str()).collect();
                Error::msg(format!(
                    "unknown image_type '{s}' (expected one of: {})",
                    known.join(", ")
                ))
            })
    }
}

/// File names the flasher offers as candidates.
pub fn looks_like_image(file_name: &str) -> bool {
    const SUFFIXES: [&str; 5] = [".img", ".iso", ".xz", ".zip", ".gz"];
    file_name == "image"
        || ImageType::guess(file_name).is_some()
        || SUFFIXES.iter().any(|s| file_name.ends_with(s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guesses_from_download_urls() {
        let cases = [
            (
                "https://downloads.raspberrypi.org/raspios_lite_armhf/images/2024-03-15-raspios-bookworm-armhf-lite.img.xz",
                Some(ImageType::RaspberryPi),
            ),
            ("https://example.org/raspbian-stretch.zip", Some(ImageType::RaspberryPi)),
            ("bone-debian-10.3-iot-armhf-2020-04-06-4gb.img.xz", Some(ImageType::BeagleBone)),
            ("kali-linux-2024.1-raspberry-pi-arm64.img.xz", Some(ImageType::Kali)),
            ("ubuntu-24.04-preinstalled-server-arm64+raspi.img.xz", Some(ImageType::Ubuntu)),
            ("debian-12-arm64.img", None),
        ];
        for (url, want) in cases {
            assert_eq!(ImageType::guess(url), want, "{url}");
        }
    }

    #[test]
    fn parses_known_names_only() {
        assert_eq!("beaglebone".parse::<ImageType>().unwrap(), ImageType::BeagleBone);
        let err = "odroid".parse::<ImageType>().unwrap_err().to_string();
        assert!(err.contains("raspberrypi"), "unexpected err: {err}");
    }

    #[test]
    fn flasher_candidates() {
        assert!(looks_like_image("image"));
        assert!(looks_like_image("custom.img"));
        assert!(looks_like_image("2024-raspios.tar"));
        assert!(!looks_like_image("notes.txt"));
    }
}
