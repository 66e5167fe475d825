//! Block layer: a uniform request interface over block devices.
//!
//! Devices implement [`BlockDevice`]; the provided `read`/`write` wrappers
//! enforce bounds and readonly policy, drive `submit` through a typed
//! [`Completion`] and keep per-device statistics. Backends complete
//! requests inline or from their own completion path; the waiter spins
//! with `pause` either way, as there is no scheduler to sleep on.

use core::fmt::Write as _;
use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use bitflags::bitflags;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOp {
    Read,
    Write,
    Flush,
    Discard,
    WriteZeroes,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RequestFlags: u32 {
        /// Force unit access: data durable before completion.
        const FUA      = 1 << 0;
        /// Flush the device cache before the operation.
        const PREFLUSH = 1 << 1;
        /// Caller is waiting synchronously.
        const SYNC     = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    /// offset + length exceeds device size
    OutOfRange,
    ReadOnly,
    Offline,
    UnsupportedOp,
    /// Backend reported failure
    Io,
    /// Volume or device lookup failed
    NotFound,
    /// No space left (extent allocation failed)
    NoSpace,
}

/// Buffer attached to a request; direction must match the operation.
pub enum RequestBuffer<'a> {
    None,
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

/// Completion state for one request. Encapsulates the spin-until-done
/// pattern so an async backend can grow later without reshaping callers.
#[derive(Debug, Default)]
pub struct Completion {
    done: AtomicBool,
    status: AtomicI32,
}

impl Completion {
    pub fn new() -> Self {
        Completion::default()
    }

    pub fn complete(&self, status: i32) {
        self.status.store(status, Ordering::Release);
        self.done.store(true, Ordering::Release);
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Busy-wait for completion.
    pub fn wait(&self) -> i32 {
        while !self.is_done() {
            core::hint::spin_loop();
        }
        self.status.load(Ordering::Acquire)
    }
}

/// One block I/O request.
pub struct BlockRequest<'a> {
    pub op: BlockOp,
    pub offset: u64,
    pub length: u32,
    pub buffer: RequestBuffer<'a>,
    pub flags: RequestFlags,
    pub completion: Option<&'a Completion>,
}

impl<'a> BlockRequest<'a> {
    pub fn finish(&self, status: i32) {
        if let Some(c) = self.completion {
            c.complete(status);
        }
    }
}

/// Canonical 8-4-4-4-12 UUID string with the v4 version nibble and the
/// 8/9/a/b variant nibble fixed, generated from two timestamp samples.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Uuid(heapless::String<36>);

impl Uuid {
    pub fn from_timestamps(t1: u64, t2: u64) -> Self {
        let mut s = heapless::String::new();
        let _ = write!(
            s,
            "{:08x}-{:04x}-4{:03x}-{:04x}-{:012x}",
            t1 as u32,
            (t1 >> 32) as u16,
            ((t2 >> 48) & 0x0FFF) as u16,
            0x8000 | ((t2 >> 32) & 0x3FFF) as u16,
            t2 & 0xFFFF_FFFF_FFFF
        );
        Uuid(s)
    }

    /// Generate from two TSC samples.
    #[cfg(target_arch = "x86_64")]
    pub fn generate() -> Self {
        let t1 = purevisor_hal::cpu::rdtsc();
        let t2 = purevisor_hal::cpu::rdtsc();
        Self::from_timestamps(t1, t2)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for Uuid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceStats {
    pub read_ops: u64,
    pub write_ops: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub errors: u64,
}

/// Identity and geometry shared by every block device.
#[derive(Debug, Clone, Default)]
pub struct DeviceInfo {
    pub name: heapless::String<32>,
    pub uuid: Uuid,
    pub size: u64,
    pub block_size: u32,
    pub num_blocks: u64,
    pub readonly: bool,
    pub online: bool,
    pub max_queue_depth: u32,
    pub stats: DeviceStats,
}

pub const BLOCK_DEFAULT_SIZE: u32 = 512;
pub const DEFAULT_QUEUE_DEPTH: u32 = 32;

impl DeviceInfo {
    pub fn new(name: &str, uuid: Uuid, size: u64) -> Self {
        let mut n = heapless::String::new();
        let _ = n.push_str(name);
        DeviceInfo {
            name: n,
            uuid,
            size,
            block_size: BLOCK_DEFAULT_SIZE,
            num_blocks: size / BLOCK_DEFAULT_SIZE as u64,
            readonly: false,
            online: false,
            max_queue_depth: DEFAULT_QUEUE_DEPTH,
            stats: DeviceStats::default(),
        }
    }
}

/// Uniform device interface. `submit` is the one required operation;
/// synchronous `read`/`write`/`write_zeroes` wrap it.
pub trait BlockDevice {
    fn info(&self) -> &DeviceInfo;
    fn info_mut(&mut self) -> &mut DeviceInfo;

    fn submit(&mut self, req: &mut BlockRequest<'_>) -> Result<(), BlockError>;

    fn flush(&mut self) -> Result<(), BlockError> {
        Ok(())
    }

    fn open(&mut self) {
        self.info_mut().online = true;
    }

    fn close(&mut self) {
        self.info_mut().online = false;
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), BlockError> {
        let len = buf.len() as u64;
        if offset + len > self.info().size {
            return Err(BlockError::OutOfRange);
        }
        let completion = Completion::new();
        let mut req = BlockRequest {
            op: BlockOp::Read,
            offset,
            length: buf.len() as u32,
            buffer: RequestBuffer::Read(buf),
            flags: RequestFlags::SYNC,
            completion: Some(&completion),
        };
        let submitted = self.submit(&mut req);
        let result = submitted.and_then(|_| match completion.wait() {
            0 => Ok(()),
            _ => Err(BlockError::Io),
        });
        let stats = &mut self.info_mut().stats;
        match result {
            Ok(()) => {
                stats.read_ops += 1;
                stats.read_bytes += len;
            }
            Err(_) => stats.errors += 1,
        }
        result
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<(), BlockError> {
        if self.info().readonly {
            return Err(BlockError::ReadOnly);
        }
        let len = buf.len() as u64;
        if offset + len > self.info().size {
            return Err(BlockError::OutOfRange);
        }
        let completion = Completion::new();
        let mut req = BlockRequest {
            op: BlockOp::Write,
            offset,
            length: buf.len() as u32,
            buffer: RequestBuffer::Write(buf),
            flags: RequestFlags::SYNC,
            completion: Some(&completion),
        };
        let submitted = self.submit(&mut req);
        let result = submitted.and_then(|_| match completion.wait() {
            0 => Ok(()),
            _ => Err(BlockError::Io),
        });
        let stats = &mut self.info_mut().stats;
        match result {
            Ok(()) => {
                stats.write_ops += 1;
                stats.write_bytes += len;
            }
            Err(_) => stats.errors += 1,
        }
        result
    }

    fn write_zeroes(&mut self, offset: u64, length: u32) -> Result<(), BlockError> {
        if self.info().readonly {
            return Err(BlockError::ReadOnly);
        }
        if offset + length as u64 > self.info().size {
            return Err(BlockError::OutOfRange);
        }
        let completion = Completion::new();
        let mut req = BlockRequest {
            op: BlockOp::WriteZeroes,
            offset,
            length,
            buffer: RequestBuffer::None,
            flags: RequestFlags::SYNC,
            completion: Some(&completion),
        };
        self.submit(&mut req)?;
        match completion.wait() {
            0 => Ok(()),
            _ => Err(BlockError::Io),
        }
    }
}
