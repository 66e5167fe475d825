//! RAM-backed block device.
//!
//! The backing store is a plain byte image, which is enough to exercise the
//! whole storage stack without hardware and serves as the staging target
//! for pooled volumes in early bring-up.

use alloc::vec;
use alloc::vec::Vec;

use crate::block::{
    BlockDevice, BlockError, BlockOp, BlockRequest, DeviceInfo, RequestBuffer, Uuid,
};
use crate::log;

pub struct MemBlockDevice {
    info: DeviceInfo,
    image: Vec<u8>,
}

impl MemBlockDevice {
    pub fn new(name: &str, size: u64, uuid: Uuid) -> Self {
        let mut info = DeviceInfo::new(name, uuid, size);
        info.online = true;
        log!("memblk: created '{}', {} MiB", name, size / (1024 * 1024));
        MemBlockDevice {
            info,
            image: vec![0u8; size as usize],
        }
    }

    pub fn read_only(name: &str, size: u64, uuid: Uuid) -> Self {
        let mut dev = Self::new(name, size, uuid);
        dev.info.readonly = true;
        dev
    }
}

impl BlockDevice for MemBlockDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn info_mut(&mut self) -> &mut DeviceInfo {
        &mut self.info
    }

    fn submit(&mut self, req: &mut BlockRequest<'_>) -> Result<(), BlockError> {
        if !self.info.online {
            req.finish(-1);
            return Err(BlockError::Offline);
        }
        let end = req.offset + req.length as u64;
        if end > self.image.len() as u64 {
            req.finish(-1);
            return Err(BlockError::OutOfRange);
        }
        let off = req.offset as usize;
        let len = req.length as usize;
        let status = match (req.op, &mut req.buffer) {
            (BlockOp::Read, RequestBuffer::Read(buf)) => {
                buf[..len].copy_from_slice(&self.image[off..off + len]);
                0
            }
            (BlockOp::Write, RequestBuffer::Write(buf)) => {
                self.image[off..off + len].copy_from_slice(&buf[..len]);
                0
            }
            (BlockOp::WriteZeroes, _) | (BlockOp::Discard, _) => {
                self.image[off..off + len].fill(0);
                0
            }
            (BlockOp::Flush, _) => 0,
            _ => -1,
        };
        req.finish(status);
        if status == 0 {
            Ok(())
        } else {
            Err(BlockError::UnsupportedOp)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let mut dev = MemBlockDevice::new("mem0", 1 << 20, Uuid::from_timestamps(1, 2));
        dev.write(4096, b"HELLO").unwrap();
        let mut buf = [0u8; 5];
        dev.read(4096, &mut buf).unwrap();
        assert_eq!(&buf, b"HELLO");
        assert_eq!(dev.info().stats.write_ops, 1);
        assert_eq!(dev.info().stats.read_ops, 1);
    }

    #[test]
    fn out_of_range_rejected() {
        let mut dev = MemBlockDevice::new("mem0", 4096, Uuid::from_timestamps(1, 2));
        let mut buf = [0u8; 8];
        assert_eq!(dev.read(4092, &mut buf), Err(BlockError::OutOfRange));
        assert_eq!(dev.info().stats.errors, 0); // rejected before submit
    }

    #[test]
    fn readonly_rejects_writes() {
        let mut dev = MemBlockDevice::read_only("rom0", 4096, Uuid::from_timestamps(1, 2));
        assert_eq!(dev.write(0, b"x"), Err(BlockError::ReadOnly));
    }

    #[test]
    fn write_zeroes_clears() {
        let mut dev = MemBlockDevice::new("mem0", 8192, Uuid::from_timestamps(1, 2));
        dev.write(0, &[0xFFu8; 16]).unwrap();
        dev.write_zeroes(0, 16).unwrap();
        let mut buf = [0xAAu8; 16];
        dev.read(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }
}
