use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use arm_image_builder::config::FlashConfig;
use arm_image_builder::devices::{Device, DeviceInventory};
use arm_image_builder::error::ErrorKind;
use arm_image_builder::flasher::{DeviceIo, Flasher};
use arm_image_builder::image::ImageOpener;
use arm_image_builder::ui::{NullUi, ScriptedUi, Ui};
use arm_image_builder::Result;

struct FakeInventory(Vec<Device>);

impl DeviceInventory for FakeInventory {
    fn devices(&self) -> Result<Vec<Device>> {
        Ok(self.0.clone())
    }
}

fn device(path: &str, mountpoints: &[&str]) -> Device {
    Device {
        path: path.to_string(),
        name: "SD card".to_string(),
        removable: true,
        read_only: false,
        size: 16 << 30,
        mountpoints: mountpoints.iter().map(|m| m.to_string()).collect(),
    }
}

/// Block device backed by memory; optionally corrupts one byte on read-back.
#[derive(Clone, Default)]
struct MemDevice {
    data: Arc<Mutex<Vec<u8>>>,
    unmounted: Arc<Mutex<Vec<String>>>,
    corrupt_at: Option<usize>,
}

struct MemWriter(Arc<Mutex<Vec<u8>>>);

impl Write for MemWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl DeviceIo for MemDevice {
    fn open_write(&self, _device: &str) -> Result<Box<dyn Write + Send>> {
        self.data.lock().unwrap().clear();
        Ok(Box::new(MemWriter(self.data.clone())))
    }

    fn open_read(&self, _device: &str) -> Result<Box<dyn Read + Send>> {
        let mut bytes = self.data.lock().unwrap().clone();
        // Trailing bytes past the image, like the rest of a real card.
        bytes.extend_from_slice(&[0xee; 4096]);
        if let Some(i) = self.corrupt_at {
            bytes[i] ^= 0x01;
        }
        Ok(Box::new(io::Cursor::new(bytes)))
    }

    fn unmount(&self, mountpoint: &str) -> Result<()> {
        self.unmounted.lock().unwrap().push(mountpoint.to_string());
        Ok(())
    }

    fn sync(&self) {}
}

fn write_image(dir: &Path) -> (std::path::PathBuf, Vec<u8>) {
    let payload: Vec<u8> = (0..300_000u32).map(|i| (i * 7 % 256) as u8).collect();
    let path = dir.join("test.img");
    fs::write(&path, &payload).unwrap();
    (path, payload)
}

fn flasher(cfg: FlashConfig, ui: Arc<dyn Ui>, devices: Vec<Device>, io: MemDevice) -> Flasher {
    Flasher::new(cfg, ui)
        .with_inventory(Box::new(FakeInventory(devices)))
        .with_io(Box::new(io))
        .with_opener(ImageOpener {
            prefer_external_tools: false,
        })
}

#[test]
fn written_bytes_verify_and_mounts_are_released() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (image, payload) = write_image(tmp.path());
    let io = MemDevice::default();
    let cfg = FlashConfig {
        image: Some(image),
        interactive: false,
        ..Default::default()
    };
    let report = flasher(
        cfg,
        Arc::new(NullUi),
        vec![device("/dev/sdz", &["/media/boot", "/media/rootfs"])],
        io.clone(),
    )
    .flash()
    .unwrap();

    assert_eq!(report.device, "/dev/sdz");
    assert_eq!(report.bytes_written, payload.len() as u64);
    assert_eq!(*io.data.lock().unwrap(), payload);
    assert_eq!(*io.unmounted.lock().unwrap(), vec!["/media/boot", "/media/rootfs"]);
}

#[test]
fn corrupted_read_back_fails_validation() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (image, _) = write_image(tmp.path());
    let io = MemDevice {
        corrupt_at: Some(12_345),
        ..Default::default()
    };
    let cfg = FlashConfig {
        image: Some(image),
        interactive: false,
        ..Default::default()
    };
    let err = flasher(cfg, Arc::new(NullUi), vec![device("/dev/sdz", &[])], io)
        .flash()
        .unwrap_err();
    assert_eq!(err.to_string(), "checksums different - validation failed");
}

#[test]
fn non_interactive_needs_exactly_one_removable_device() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (image, _) = write_image(tmp.path());
    let cfg = FlashConfig {
        image: Some(image),
        interactive: false,
        ..Default::default()
    };

    for devices in [vec![], vec![device("/dev/sdy", &[]), device("/dev/sdz", &[])]] {
        let io = MemDevice::default();
        let err = flasher(cfg.clone(), Arc::new(NullUi), devices, io.clone())
            .flash()
            .unwrap_err()
            .to_string();
        assert!(err.starts_with("ambiguous device"), "unexpected err: {err}");
        assert!(io.data.lock().unwrap().is_empty());
    }

    let mut read_only = device("/dev/sdx", &[]);
    read_only.read_only = true;
    let report = flasher(
        cfg,
        Arc::new(NullUi),
        vec![read_only, device("/dev/sdz", &[])],
        MemDevice::default(),
    )
    .flash()
    .unwrap();
    assert_eq!(report.device, "/dev/sdz");
}

#[test]
fn configured_device_must_be_a_candidate() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (image, _) = write_image(tmp.path());
    let cfg = FlashConfig {
        image: Some(image),
        device: Some("/dev/sda".into()),
        interactive: false,
        ..Default::default()
    };
    let err = flasher(cfg, Arc::new(NullUi), vec![device("/dev/sdz", &[])], MemDevice::default())
        .flash()
        .unwrap_err()
        .to_string();
    assert_eq!(err, "configured device /dev/sda not found");
}

#[test]
fn only_yes_confirms() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (image, _) = write_image(tmp.path());

    for answer in ["no", "", "y", "  nope yes"] {
        let io = MemDevice::default();
        let ui = Arc::new(ScriptedUi::new([answer]));
        let cfg = FlashConfig {
            image: Some(image.clone()),
            device: Some("sdz".into()),
            ..Default::default()
        };
        let err = flasher(cfg, ui, vec![device("/dev/sdz", &["/media/x"])], io.clone())
            .flash()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Declined, "answer {answer:?}");
        assert_eq!(err.to_string(), "canceled by user");
        assert!(io.data.lock().unwrap().is_empty());
        assert!(io.unmounted.lock().unwrap().is_empty());
    }

    let io = MemDevice::default();
    let cfg = FlashConfig {
        image: Some(image),
        device: Some("sdz".into()),
        ..Default::default()
    };
    flasher(cfg, Arc::new(ScriptedUi::new(["  YES  "])), vec![device("/dev/sdz", &[])], io.clone())
        .flash()
        .unwrap();
    assert!(!io.data.lock().unwrap().is_empty());
}

#[test]
fn interactive_image_and_device_prompts() {
    let tmp = tempfile::tempdir().expect("tempdir");
    fs::write(tmp.path().join("a.img"), b"first").unwrap();
    fs::write(tmp.path().join("b.img"), b"second").unwrap();
    let io = MemDevice::default();
    // image choice, device choice, confirmation
    let ui = Arc::new(ScriptedUi::new(["", "2", "yes"]));
    let report = Flasher::new(FlashConfig::default(), ui.clone())
        .with_inventory(Box::new(FakeInventory(vec![
            device("/dev/sdy", &[]),
            device("/dev/sdz", &[]),
        ])))
        .with_io(Box::new(io.clone()))
        .with_search_dir(tmp.path())
        .with_opener(ImageOpener {
            prefer_external_tools: false,
        })
        .flash()
        .unwrap();
    assert_eq!(report.device, "/dev/sdz");
    assert!(ui.transcript().iter().any(|l| l.contains("2) /dev/sdz")));
}
