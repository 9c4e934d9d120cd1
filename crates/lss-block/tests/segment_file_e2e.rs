#![forbid(unsafe_code)]
//! Segment manager over a file-backed device.

use lss_block::{FileByteDevice, SegmentGeometry, SegmentManager, SegmentedDevice};
use lss_types::{Paddr, SegmentId};
use proptest::prelude::*;

fn geometry() -> SegmentGeometry {
    SegmentGeometry::new(8 * 65536, 4096, 65536).expect("geometry")
}

#[test]
fn file_segments_survive_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("segments.img");
    let g = geometry();
    {
        let file = FileByteDevice::create(&path, g.size).expect("create");
        let dev = SegmentedDevice::new(file, g).expect("segmented");
        dev.open(SegmentId(3)).expect("open");
        dev.write(Paddr::new(SegmentId(3), 4096), b"durable bytes")
            .expect("write");
        dev.sync().expect("sync");
    }

    let file = FileByteDevice::open(&path).expect("reopen");
    let dev = SegmentedDevice::new(file, g).expect("segmented");
    let mut buf = [0_u8; 13];
    dev.read(Paddr::new(SegmentId(3), 4096), &mut buf)
        .expect("read");
    assert_eq!(&buf, b"durable bytes");
}

#[test]
fn undersized_file_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("small.img");
    let file = FileByteDevice::create(&path, 65536).expect("create");
    assert!(SegmentedDevice::new(file, geometry()).is_err());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Sequential block-aligned appends always succeed until the segment is
    /// full, and every appended block reads back.
    #[test]
    fn sequential_appends_read_back(lens in proptest::collection::vec(1_usize..3 * 4096, 1..24)) {
        let dev = SegmentedDevice::ephemeral(geometry()).expect("device");
        let id = SegmentId(0);
        dev.open(id).expect("open");
        let mut offset = 0_usize;
        let mut written = Vec::new();
        for (i, len) in lens.into_iter().enumerate() {
            let fill = u8::try_from(i % 251).expect("fits") + 1;
            let data = vec![fill; len];
            let addr = Paddr::new(id, i32::try_from(offset).expect("offset"));
            if offset + len > 65536 {
                prop_assert!(dev.write(addr, &data).is_err());
                break;
            }
            dev.write(addr, &data).expect("append");
            written.push((addr, data));
            offset = (offset + len).div_ceil(4096) * 4096;
        }
        for (addr, data) in written {
            let mut buf = vec![0_u8; data.len()];
            dev.read(addr, &mut buf).expect("read");
            prop_assert_eq!(buf, data);
        }
    }
}
