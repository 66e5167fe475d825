//! Pooled storage: extent allocation, thin provisioning, replication.
//!
//! A pool owns its devices and volumes; extents are fixed 4 MiB units
//! carved out of each device when it is added. Extent id 0 is a reserved
//! sentinel so a volume's extent map can use 0 for "unallocated". Volumes
//! route their I/O through the pool: thin volumes allocate on first write
//! and read zeros from unmapped ranges; replicated extents fan writes out
//! to every replica, and a failed replica degrades the pool without
//! failing the write.
//!
//! When a pool is shared across CPUs the owner wraps it in a `spin::Mutex`;
//! the pool itself is a plain owning context.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::block::{
    BlockDevice, BlockError, BlockRequest, DeviceInfo, RequestBuffer, Uuid, BLOCK_DEFAULT_SIZE,
};
use crate::{log, log_error, log_warn};

/// Pool allocation unit.
pub const EXTENT_SIZE: u64 = 4 * 1024 * 1024;

/// Most replicas a single extent can carry.
pub const MAX_REPLICAS: usize = 3;

pub const MAX_DEVICES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentState {
    Free,
    Allocated,
    /// Held by a snapshot or otherwise pinned.
    Reserved,
}

#[derive(Debug, Clone, Copy)]
pub struct Extent {
    pub state: ExtentState,
    pub volume_id: u32,
    pub volume_offset: u64,
    pub device_id: u32,
    pub device_offset: u64,
    pub replica_count: u8,
    pub replica_extents: [u32; MAX_REPLICAS],
}

impl Extent {
    fn unused(device_id: u32, device_offset: u64) -> Self {
        Extent {
            state: ExtentState::Free,
            volume_id: 0,
            volume_offset: 0,
            device_id,
            device_offset,
            replica_count: 0,
            replica_extents: [0; MAX_REPLICAS],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Offline,
    Degraded,
    Online,
    Rebuilding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    Offline,
    /// No free extent satisfies the request
    NoSpace,
    TooManyDevices,
    /// Device still backs allocated extents
    DeviceBusy,
    VolumeNotFound,
    /// Volume shrink is not supported
    ShrinkRejected,
    Block(BlockError),
}

impl From<BlockError> for PoolError {
    fn from(e: BlockError) -> Self {
        PoolError::Block(e)
    }
}

/// A logical volume carved from the pool.
pub struct Volume {
    pub id: u32,
    pub name: heapless::String<32>,
    pub uuid: Uuid,
    pub size: u64,
    pub num_extents: u32,
    /// index = logical extent, value = pool extent id, 0 = unallocated.
    extent_map: Vec<u32>,
    pub replication: u8,
    pub thin: bool,
    pub online: bool,
    pub allocated: u64,
    /// The volume's embedded block-device identity.
    pub device_info: DeviceInfo,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub read_ops: u64,
    pub write_ops: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub replica_failures: u64,
}

/// A storage pool: devices, the extent table and the volumes on top.
pub struct StoragePool {
    pub name: heapless::String<32>,
    pub uuid: Uuid,
    pub state: PoolState,
    devices: Vec<Box<dyn BlockDevice + Send>>,
    extents: Vec<Extent>,
    free_extents: u64,
    /// Rotating allocation cursor.
    next_extent: u32,
    volumes: Vec<Volume>,
    next_volume_id: u32,
    pub total_size: u64,
    pub used_size: u64,
    pub free_size: u64,
    pub stats: PoolStats,
}

impl StoragePool {
    pub fn new(name: &str, uuid: Uuid) -> Self {
        let mut n = heapless::String::new();
        let _ = n.push_str(name);
        log!("pool: created '{}' ({})", name, uuid);
        StoragePool {
            name: n,
            uuid,
            state: PoolState::Offline,
            devices: Vec::new(),
            extents: Vec::new(),
            free_extents: 0,
            next_extent: 1,
            volumes: Vec::new(),
            next_volume_id: 1,
            total_size: 0,
            used_size: 0,
            free_size: 0,
            stats: PoolStats::default(),
        }
    }

    /// Add a device; its capacity is carved into fresh free extents with
    /// sequential device offsets. The first device brings the pool online.
    pub fn add_device(&mut self, dev: Box<dyn BlockDevice + Send>) -> Result<u32, PoolError> {
        if self.devices.len() >= MAX_DEVICES {
            return Err(PoolError::TooManyDevices);
        }
        if self.extents.is_empty() {
            // Sentinel: extent id 0 means "unallocated" in volume maps.
            let mut sentinel = Extent::unused(u32::MAX, 0);
            sentinel.state = ExtentState::Reserved;
            self.extents.push(sentinel);
        }
        let device_id = self.devices.len() as u32;
        let dev_extents = dev.info().size / EXTENT_SIZE;
        let name: heapless::String<32> = dev.info().name.clone();
        self.devices.push(dev);

        let mut offset = 0u64;
        for _ in 0..dev_extents {
            self.extents.push(Extent::unused(device_id, offset));
            offset += EXTENT_SIZE;
        }
        self.free_extents += dev_extents;
        self.total_size += dev_extents * EXTENT_SIZE;
        self.free_size = self.free_extents * EXTENT_SIZE;

        if self.state == PoolState::Offline {
            self.state = PoolState::Online;
        }
        log!(
            "pool '{}': added device '{}' (+{} MiB)",
            self.name,
            name,
            dev_extents * EXTENT_SIZE / (1024 * 1024)
        );
        Ok(device_id)
    }

    /// Remove a device. Refused while any of its extents are allocated.
    pub fn remove_device(&mut self, device_id: u32) -> Result<(), PoolError> {
        if device_id as usize >= self.devices.len() {
            return Err(PoolError::Block(BlockError::NotFound));
        }
        let busy = self.extents.iter().any(|e| {
            e.device_id == device_id && e.state == ExtentState::Allocated
        });
        if busy {
            log_error!("pool '{}': cannot remove device with allocated extents", self.name);
            return Err(PoolError::DeviceBusy);
        }
        let dev_extents: u64 = self
            .extents
            .iter()
            .filter(|e| e.device_id == device_id && e.state == ExtentState::Free)
            .count() as u64;
        for e in self.extents.iter_mut() {
            if e.device_id == device_id {
                // Leave the slots in the table but make them unallocatable.
                e.state = ExtentState::Reserved;
            }
        }
        self.free_extents -= dev_extents;
        self.total_size -= dev_extents * EXTENT_SIZE;
        self.free_size = self.free_extents * EXTENT_SIZE;
        self.devices[device_id as usize].close();
        Ok(())
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn extent(&self, id: u32) -> Option<&Extent> {
        self.extents.get(id as usize)
    }

    pub fn free_extent_count(&self) -> u64 {
        self.free_extents
    }

    /// Allocate one extent, scanning forward from the rotating cursor and
    /// wrapping once.
    pub fn alloc_extent(&mut self) -> Result<u32, PoolError> {
        self.alloc_extent_filtered(|_| true)
    }

    fn alloc_extent_filtered(
        &mut self,
        mut accept: impl FnMut(&Extent) -> bool,
    ) -> Result<u32, PoolError> {
        if self.free_extents == 0 {
            return Err(PoolError::NoSpace);
        }
        let total = self.extents.len() as u32;
        let start = self.next_extent.clamp(1, total.max(1));
        let scan = (start..total).chain(1..start);
        for i in scan {
            let e = &self.extents[i as usize];
            if e.state == ExtentState::Free && accept(e) {
                self.extents[i as usize].state = ExtentState::Allocated;
                self.free_extents -= 1;
                self.next_extent = i + 1;
                return Ok(i);
            }
        }
        Err(PoolError::NoSpace)
    }

    /// Return an extent (and nothing else) to the free set.
    pub fn free_extent(&mut self, extent_id: u32) {
        if extent_id == 0 || extent_id as usize >= self.extents.len() {
            return;
        }
        let e = &mut self.extents[extent_id as usize];
        if e.state != ExtentState::Allocated {
            return;
        }
        e.state = ExtentState::Free;
        e.volume_id = 0;
        e.volume_offset = 0;
        e.replica_count = 0;
        e.replica_extents = [0; MAX_REPLICAS];
        self.free_extents += 1;
    }

    /// Allocate a primary plus `replicas` replica extents, preferring
    /// distinct devices for the replicas. Rolls back on failure.
    pub fn alloc_replicated_extent(&mut self, replicas: u8) -> Result<u32, PoolError> {
        let replicas = replicas.min(MAX_REPLICAS as u8);
        if self.free_extents < replicas as u64 + 1 {
            return Err(PoolError::NoSpace);
        }
        let primary = self.alloc_extent()?;
        let mut chosen: Vec<u32> = Vec::new();
        let mut used_devices: Vec<u32> = Vec::new();
        used_devices.push(self.extents[primary as usize].device_id);

        for _ in 0..replicas {
            let distinct = {
                let used = used_devices.clone();
                self.alloc_extent_filtered(move |e| !used.contains(&e.device_id))
            };
            let replica = match distinct {
                Ok(id) => id,
                // No unused device left: co-locating beats failing.
                Err(_) => match self.alloc_extent() {
                    Ok(id) => id,
                    Err(e) => {
                        for id in chosen {
                            self.free_extent(id);
                        }
                        self.free_extent(primary);
                        return Err(e);
                    }
                },
            };
            used_devices.push(self.extents[replica as usize].device_id);
            chosen.push(replica);
        }

        let e = &mut self.extents[primary as usize];
        e.replica_count = replicas;
        for (slot, id) in e.replica_extents.iter_mut().zip(chosen.iter()) {
            *slot = *id;
        }
        Ok(primary)
    }

    // ------------------------------------------------------------------
    // Volumes
    // ------------------------------------------------------------------

    /// Create a volume. Thin volumes start with an all-zero extent map;
    /// thick volumes are fully backed (with replicas) up front.
    pub fn create_volume(
        &mut self,
        name: &str,
        size: u64,
        replicas: u8,
        thin: bool,
        uuid: Uuid,
    ) -> Result<u32, PoolError> {
        if self.state == PoolState::Offline {
            return Err(PoolError::Offline);
        }
        let num_extents = size.div_ceil(EXTENT_SIZE) as u32;
        let needed = num_extents as u64 * (replicas as u64 + 1);
        if !thin && self.free_extents < needed {
            log_error!("pool '{}': not enough space for volume '{}'", self.name, name);
            return Err(PoolError::NoSpace);
        }

        let id = self.next_volume_id;
        self.next_volume_id += 1;

        let mut extent_map = alloc::vec![0u32; num_extents as usize];
        let mut allocated = 0u64;
        if !thin {
            for (i, slot) in extent_map.iter_mut().enumerate() {
                match self.alloc_replicated_extent(replicas) {
                    Ok(primary) => {
                        let e = &mut self.extents[primary as usize];
                        e.volume_id = id;
                        e.volume_offset = i as u64 * EXTENT_SIZE;
                        *slot = primary;
                        allocated += EXTENT_SIZE;
                    }
                    Err(err) => {
                        for s in extent_map.iter().take(i) {
                            self.release_extent_with_replicas(*s);
                        }
                        return Err(err);
                    }
                }
            }
            let backed = num_extents as u64 * (replicas as u64 + 1) * EXTENT_SIZE;
            self.used_size += backed;
            self.free_size = self.free_extents * EXTENT_SIZE;
        }

        let mut vname = heapless::String::new();
        let _ = vname.push_str(name);
        let mut device_info = DeviceInfo::new(name, uuid.clone(), num_extents as u64 * EXTENT_SIZE);
        device_info.block_size = BLOCK_DEFAULT_SIZE;
        device_info.num_blocks = device_info.size / BLOCK_DEFAULT_SIZE as u64;
        device_info.online = true;

        self.volumes.push(Volume {
            id,
            name: vname,
            uuid,
            size: num_extents as u64 * EXTENT_SIZE,
            num_extents,
            extent_map,
            replication: replicas,
            thin,
            online: true,
            allocated,
            device_info,
        });
        log!(
            "pool '{}': created volume '{}' ({} MiB, {})",
            self.name,
            name,
            num_extents as u64 * EXTENT_SIZE / (1024 * 1024),
            if thin { "thin" } else { "thick" }
        );
        Ok(id)
    }

    fn release_extent_with_replicas(&mut self, extent_id: u32) {
        if extent_id == 0 {
            return;
        }
        let (count, replicas) = {
            let e = &self.extents[extent_id as usize];
            (e.replica_count as usize, e.replica_extents)
        };
        for rid in replicas.iter().take(count) {
            self.free_extent(*rid);
        }
        self.free_extent(extent_id);
    }

    /// Destroy a volume, freeing every primary and replica extent.
    pub fn destroy_volume(&mut self, volume_id: u32) -> Result<(), PoolError> {
        let idx = self
            .volumes
            .iter()
            .position(|v| v.id == volume_id)
            .ok_or(PoolError::VolumeNotFound)?;
        let vol = self.volumes.remove(idx);
        let free_before = self.free_extents;
        for &ext in vol.extent_map.iter().filter(|&&e| e != 0) {
            self.release_extent_with_replicas(ext);
        }
        // Extents pinned by snapshots stay allocated and stay accounted.
        let released = (self.free_extents - free_before) * EXTENT_SIZE;
        self.used_size = self.used_size.saturating_sub(released);
        self.free_size = self.free_extents * EXTENT_SIZE;
        log!("pool '{}': destroyed volume '{}'", self.name, vol.name);
        Ok(())
    }

    /// Grow a volume's extent map; shrinking is rejected.
    pub fn resize_volume(&mut self, volume_id: u32, new_size: u64) -> Result<(), PoolError> {
        let vol = self
            .volumes
            .iter_mut()
            .find(|v| v.id == volume_id)
            .ok_or(PoolError::VolumeNotFound)?;
        let new_extents = new_size.div_ceil(EXTENT_SIZE) as u32;
        if new_extents < vol.num_extents {
            return Err(PoolError::ShrinkRejected);
        }
        if new_extents == vol.num_extents {
            return Ok(());
        }
        vol.extent_map.resize(new_extents as usize, 0);
        vol.num_extents = new_extents;
        vol.size = new_extents as u64 * EXTENT_SIZE;
        vol.device_info.size = vol.size;
        vol.device_info.num_blocks = vol.size / BLOCK_DEFAULT_SIZE as u64;
        log!(
            "pool '{}': resized volume '{}' to {} MiB",
            self.name,
            vol.name,
            vol.size / (1024 * 1024)
        );
        Ok(())
    }

    /// Snapshot: a thin volume whose extent map is a copy of the source.
    /// Shared extents are pinned as Reserved; copy-on-write is a future
    /// extension.
    pub fn snapshot_volume(
        &mut self,
        volume_id: u32,
        name: &str,
        uuid: Uuid,
    ) -> Result<u32, PoolError> {
        let (size, replication, src_map) = {
            let vol = self
                .volumes
                .iter()
                .find(|v| v.id == volume_id)
                .ok_or(PoolError::VolumeNotFound)?;
            (vol.size, vol.replication, vol.extent_map.clone())
        };
        let snap_id = self.create_volume(name, size, replication, true, uuid)?;
        for &ext in src_map.iter().filter(|&&e| e != 0) {
            self.extents[ext as usize].state = ExtentState::Reserved;
        }
        let snap = self
            .volumes
            .iter_mut()
            .find(|v| v.id == snap_id)
            .expect("just created");
        snap.extent_map = src_map;
        log!("pool '{}': snapshot '{}' of volume {}", self.name, name, volume_id);
        Ok(snap_id)
    }

    pub fn volume(&self, volume_id: u32) -> Option<&Volume> {
        self.volumes.iter().find(|v| v.id == volume_id)
    }

    pub fn volume_by_name(&self, name: &str) -> Option<&Volume> {
        self.volumes.iter().find(|v| v.name.as_str() == name)
    }

    pub fn volume_id_by_name(&self, name: &str) -> Option<u32> {
        self.volume_by_name(name).map(|v| v.id)
    }

    pub fn volumes(&self) -> &[Volume] {
        &self.volumes
    }

    // ------------------------------------------------------------------
    // Volume I/O
    // ------------------------------------------------------------------

    /// Read from a volume. Unmapped extents of a thin volume yield zeros.
    pub fn read_volume(
        &mut self,
        volume_id: u32,
        mut offset: u64,
        mut buf: &mut [u8],
    ) -> Result<(), PoolError> {
        self.check_volume_io(volume_id, offset, buf.len() as u64)?;
        while !buf.is_empty() {
            let extent_idx = (offset / EXTENT_SIZE) as usize;
            let extent_offset = offset % EXTENT_SIZE;
            let chunk = ((EXTENT_SIZE - extent_offset) as usize).min(buf.len());
            let (head, rest) = core::mem::take(&mut buf).split_at_mut(chunk);

            let pool_extent = {
                let vol = self.volume(volume_id).ok_or(PoolError::VolumeNotFound)?;
                vol.extent_map[extent_idx]
            };
            if pool_extent == 0 {
                head.fill(0);
            } else {
                let (device_id, device_offset) = {
                    let e = &self.extents[pool_extent as usize];
                    (e.device_id, e.device_offset)
                };
                self.devices[device_id as usize]
                    .read(device_offset + extent_offset, head)?;
                self.stats.read_ops += 1;
                self.stats.read_bytes += chunk as u64;
            }
            offset += chunk as u64;
            buf = rest;
        }
        Ok(())
    }

    /// Write to a volume. Unmapped extents of a thin volume are allocated
    /// on demand (with the volume's replica count); replica write failures
    /// degrade the pool but do not fail the write.
    pub fn write_volume(
        &mut self,
        volume_id: u32,
        mut offset: u64,
        mut data: &[u8],
    ) -> Result<(), PoolError> {
        self.check_volume_io(volume_id, offset, data.len() as u64)?;
        while !data.is_empty() {
            let extent_idx = (offset / EXTENT_SIZE) as usize;
            let extent_offset = offset % EXTENT_SIZE;
            let chunk = ((EXTENT_SIZE - extent_offset) as usize).min(data.len());
            let (head, rest) = data.split_at(chunk);

            let (pool_extent, replication) = {
                let vol = self.volume(volume_id).ok_or(PoolError::VolumeNotFound)?;
                (vol.extent_map[extent_idx], vol.replication)
            };
            let pool_extent = if pool_extent != 0 {
                pool_extent
            } else {
                let primary = self.alloc_replicated_extent(replication)?;
                {
                    let e = &mut self.extents[primary as usize];
                    e.volume_id = volume_id;
                    e.volume_offset = extent_idx as u64 * EXTENT_SIZE;
                }
                let backed = (1 + replication as u64) * EXTENT_SIZE;
                self.used_size += backed;
                self.free_size = self.free_extents * EXTENT_SIZE;
                let vol = self
                    .volumes
                    .iter_mut()
                    .find(|v| v.id == volume_id)
                    .ok_or(PoolError::VolumeNotFound)?;
                vol.extent_map[extent_idx] = primary;
                vol.allocated += EXTENT_SIZE;
                primary
            };

            let (device_id, device_offset, replica_count, replica_extents) = {
                let e = &self.extents[pool_extent as usize];
                (e.device_id, e.device_offset, e.replica_count, e.replica_extents)
            };
            self.devices[device_id as usize]
                .write(device_offset + extent_offset, head)?;
            self.stats.write_ops += 1;
            self.stats.write_bytes += chunk as u64;

            for &rid in replica_extents.iter().take(replica_count as usize) {
                let (rdev, roff) = {
                    let r = &self.extents[rid as usize];
                    (r.device_id, r.device_offset)
                };
                if self.devices[rdev as usize]
                    .write(roff + extent_offset, head)
                    .is_err()
                {
                    self.stats.replica_failures += 1;
                    self.state = PoolState::Degraded;
                    log_warn!(
                        "pool '{}': replica write failed on device {}, pool degraded",
                        self.name,
                        rdev
                    );
                }
            }
            offset += chunk as u64;
            data = rest;
        }
        Ok(())
    }

    /// Flush every device in the pool.
    pub fn flush(&mut self) -> Result<(), PoolError> {
        for dev in self.devices.iter_mut() {
            dev.flush()?;
        }
        Ok(())
    }

    fn check_volume_io(&self, volume_id: u32, offset: u64, len: u64) -> Result<(), PoolError> {
        if self.state == PoolState::Offline {
            return Err(PoolError::Offline);
        }
        let vol = self.volume(volume_id).ok_or(PoolError::VolumeNotFound)?;
        if !vol.online {
            return Err(PoolError::Offline);
        }
        if offset + len > vol.size {
            return Err(PoolError::Block(BlockError::OutOfRange));
        }
        Ok(())
    }

    /// Borrow a volume as a block device.
    pub fn volume_device(&mut self, volume_id: u32) -> Option<VolumeIo<'_>> {
        self.volume(volume_id)?;
        Some(VolumeIo {
            pool: self,
            volume_id,
        })
    }
}

impl Volume {
    /// Pool extent id backing a logical extent (0 = unallocated).
    pub fn mapped_extent(&self, index: u32) -> Option<u32> {
        self.extent_map.get(index as usize).copied()
    }
}

/// A volume borrowed from its pool, presented through the block-device
/// interface.
pub struct VolumeIo<'a> {
    pool: &'a mut StoragePool,
    volume_id: u32,
}

impl BlockDevice for VolumeIo<'_> {
    fn info(&self) -> &DeviceInfo {
        &self
            .pool
            .volume(self.volume_id)
            .expect("volume disappeared under VolumeIo")
            .device_info
    }

    fn info_mut(&mut self) -> &mut DeviceInfo {
        let id = self.volume_id;
        &mut self
            .pool
            .volumes
            .iter_mut()
            .find(|v| v.id == id)
            .expect("volume disappeared under VolumeIo")
            .device_info
    }

    fn submit(&mut self, req: &mut BlockRequest<'_>) -> Result<(), BlockError> {
        use crate::block::BlockOp;
        let result = match (req.op, &mut req.buffer) {
            (BlockOp::Read, RequestBuffer::Read(buf)) => {
                self.pool.read_volume(self.volume_id, req.offset, buf)
            }
            (BlockOp::Write, RequestBuffer::Write(buf)) => {
                self.pool.write_volume(self.volume_id, req.offset, buf)
            }
            (BlockOp::Flush, _) => self.pool.flush(),
            _ => Err(PoolError::Block(BlockError::UnsupportedOp)),
        };
        match result {
            Ok(()) => {
                req.finish(0);
                Ok(())
            }
            Err(e) => {
                req.finish(-1);
                Err(match e {
                    PoolError::Block(b) => b,
                    PoolError::NoSpace => BlockError::NoSpace,
                    PoolError::VolumeNotFound => BlockError::NotFound,
                    _ => BlockError::Io,
                })
            }
        }
    }

    fn flush(&mut self) -> Result<(), BlockError> {
        self.pool.flush().map_err(|_| BlockError::Io)
    }
}
