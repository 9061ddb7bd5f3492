use arm_image_builder::mbr::{Mbr, MbrError, SECTOR_SIZE};

fn sector(parts: &[(usize, u8, u8, u32, u32)]) -> [u8; SECTOR_SIZE] {
    let mut b = [0u8; SECTOR_SIZE];
    b[..4].copy_from_slice(&[0xfa, 0xb8, 0x00, 0x10]);
    b[440..444].copy_from_slice(&0x1234_5678u32.to_le_bytes());
    for &(slot, boot, ty, start, len) in parts {
        let off = 446 + slot * 16;
        b[off] = boot;
        b[off + 4] = ty;
        b[off + 8..off + 12].copy_from_slice(&start.to_le_bytes());
        b[off + 12..off + 16].copy_from_slice(&len.to_le_bytes());
    }
    b[510] = 0x55;
    b[511] = 0xAA;
    b
}

#[test]
fn read_then_write_is_byte_identical() {
    let layouts: [&[(usize, u8, u8, u32, u32)]; 3] = [
        &[],
        &[(0, 0x80, 0x0c, 8192, 524288), (1, 0x00, 0x83, 532480, 3637248)],
        &[(0, 0x00, 0x83, 2048, 100), (2, 0x00, 0x83, 4096, 100), (3, 0x00, 0x82, 8192, 1)],
    ];
    for parts in layouts {
        let raw = sector(parts);
        let mbr = Mbr::read(&raw[..]).unwrap();
        let mut out = Vec::new();
        mbr.write(&mut out).unwrap();
        assert_eq!(out, raw.to_vec());
    }
}

#[test]
fn set_lba_len_reads_back_exactly() {
    let len = 3_637_248u32;
    let mut mbr = Mbr::from_bytes(sector(&[(1, 0x00, 0x83, 532480, len)]));
    for extra in [0u32, 1, 2048, 1 << 20, u32::MAX - len] {
        mbr.partition_mut(1).unwrap().set_lba_len(len + extra);
        assert_eq!(mbr.partition_mut(1).unwrap().lba_len(), len + extra);
    }
}

#[test]
fn empty_table_with_signature_passes_check() {
    Mbr::from_bytes(sector(&[])).check().unwrap();
}

#[test]
fn flipped_signature_bytes_fail() {
    for idx in [510, 511] {
        let mut raw = sector(&[]);
        raw[idx] ^= 0xff;
        assert!(matches!(Mbr::from_bytes(raw).check(), Err(MbrError::BadSignature)));
        assert!(matches!(Mbr::read(&raw[..]), Err(MbrError::BadSignature)));
    }
}

#[test]
fn overlapping_partitions_fail() {
    let raw = sector(&[(0, 0x00, 0x83, 2048, 4096), (1, 0x00, 0x83, 6143, 100)]);
    assert!(matches!(
        Mbr::from_bytes(raw).check(),
        Err(MbrError::PartitionOverlap { .. })
    ));
}

#[test]
fn invalid_boot_flag_fails() {
    let raw = sector(&[(0, 0x01, 0x83, 2048, 4096)]);
    assert!(matches!(
        Mbr::from_bytes(raw).check(),
        Err(MbrError::BadBootFlag { slot: 0, value: 0x01 })
    ));
}

#[test]
fn last_partition_is_highest_start_not_highest_slot() {
    let mut mbr = Mbr::from_bytes(sector(&[
        (0, 0x00, 0x83, 100_000, 1000),
        (1, 0x00, 0x0c, 2048, 1000),
    ]));
    assert_eq!(mbr.last_partition().map(|p| p.slot), Some(0));
    assert_eq!(mbr.grow_last_partition(24).unwrap(), 0);
    assert_eq!(mbr.partitions()[0].lba_len, 1024);
    assert_eq!(mbr.partitions()[1].lba_len, 1000);
}
