//! Replicated storage: volume writes carried through the Raft log.
//!
//! A write is packed as `[volume-name: 64 bytes null-padded][offset: u64 LE]
//! [length: u32 LE][data]`, submitted on the leader, and applied on every
//! node by performing the same volume write against the local pool. Reads
//! are always local.

use alloc::vec::Vec;

use crate::block::Uuid;
use crate::pool::StoragePool;
use crate::raft::{
    LogEntry, RaftApply, RaftError, RaftNode, RaftRole, RaftTransport, LOG_WRITE,
};
use crate::{log, log_warn};

const VOLUME_NAME_LEN: usize = 64;
const WRITE_HEADER_LEN: usize = VOLUME_NAME_LEN + 8 + 4;

/// Pack a replicated write payload.
pub fn encode_write(volume: &str, offset: u64, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(WRITE_HEADER_LEN + data.len());
    let mut name = [0u8; VOLUME_NAME_LEN];
    let n = volume.len().min(VOLUME_NAME_LEN - 1);
    name[..n].copy_from_slice(&volume.as_bytes()[..n]);
    out.extend_from_slice(&name);
    out.extend_from_slice(&offset.to_le_bytes());
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
    out
}

/// Unpack a replicated write payload.
pub fn decode_write(bytes: &[u8]) -> Option<(&str, u64, &[u8])> {
    if bytes.len() < WRITE_HEADER_LEN {
        return None;
    }
    let name_raw = &bytes[..VOLUME_NAME_LEN];
    let end = name_raw.iter().position(|&b| b == 0).unwrap_or(VOLUME_NAME_LEN);
    let name = core::str::from_utf8(&name_raw[..end]).ok()?;

    let mut off = [0u8; 8];
    off.copy_from_slice(&bytes[VOLUME_NAME_LEN..VOLUME_NAME_LEN + 8]);
    let offset = u64::from_le_bytes(off);

    let mut len = [0u8; 4];
    len.copy_from_slice(&bytes[VOLUME_NAME_LEN + 8..WRITE_HEADER_LEN]);
    let length = u32::from_le_bytes(len) as usize;

    let data = bytes.get(WRITE_HEADER_LEN..WRITE_HEADER_LEN + length)?;
    Some((name, offset, data))
}

/// Applies committed write entries to the local pool.
struct PoolApplier<'a> {
    pool: &'a mut StoragePool,
    applied: u64,
}

impl RaftApply for PoolApplier<'_> {
    fn apply(&mut self, entry: &LogEntry) {
        self.applied += 1;
        if entry.kind != LOG_WRITE {
            return;
        }
        let Some((volume, offset, data)) = decode_write(&entry.data) else {
            log_warn!("dist: malformed write entry at index {}", entry.index);
            return;
        };
        let Some(volume_id) = self.pool.volume_id_by_name(volume) else {
            log_warn!("dist: write for unknown volume '{}'", volume);
            return;
        };
        if self.pool.write_volume(volume_id, offset, data).is_err() {
            log_warn!("dist: apply failed for volume '{}' @ {:#x}", volume, offset);
        }
    }
}

/// One node's view of the replicated storage layer.
pub struct DistributedStorage {
    raft: RaftNode,
    pub cluster_name: heapless::String<32>,
    pub cluster_uuid: Uuid,
    pub replicated_writes: u64,
    pub applied_entries: u64,
}

impl DistributedStorage {
    pub fn new(node_id: u32, seed: u64, cluster_uuid: Uuid) -> Self {
        let mut name = heapless::String::new();
        let _ = name.push_str("purevisor-cluster");
        log!("dist: initialized node {}", node_id);
        DistributedStorage {
            raft: RaftNode::new(node_id, seed),
            cluster_name: name,
            cluster_uuid,
            replicated_writes: 0,
            applied_entries: 0,
        }
    }

    pub fn raft(&self) -> &RaftNode {
        &self.raft
    }

    /// Add a remote peer to the consensus group.
    pub fn join(&mut self, peer_id: u32) -> Result<(), RaftError> {
        self.raft.add_peer(peer_id)
    }

    pub fn role(&self) -> RaftRole {
        self.raft.role()
    }

    /// Submit a replicated volume write. Followers refuse; the caller
    /// redirects to the leader.
    pub fn write(&mut self, volume: &str, offset: u64, data: &[u8]) -> Result<u64, RaftError> {
        if !self.raft.is_leader() {
            return Err(RaftError::NotLeader);
        }
        let payload = encode_write(volume, offset, data);
        let index = self.raft.submit(LOG_WRITE, &payload)?;
        self.replicated_writes += 1;
        Ok(index)
    }

    /// Local volume read.
    pub fn read(
        &self,
        pool: &mut StoragePool,
        volume: &str,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<(), crate::pool::PoolError> {
        let id = pool
            .volume_id_by_name(volume)
            .ok_or(crate::pool::PoolError::VolumeNotFound)?;
        pool.read_volume(id, offset, buf)
    }

    /// Drive timeouts and apply newly committed writes to `pool`.
    pub fn tick(&mut self, now_ms: u64, tx: &mut dyn RaftTransport, pool: &mut StoragePool) {
        let mut applier = PoolApplier { pool, applied: 0 };
        self.raft.tick(now_ms, tx, &mut applier);
        self.applied_entries += applier.applied;
    }

    /// Feed one incoming message, applying any entries it commits.
    pub fn receive(
        &mut self,
        bytes: &[u8],
        now_ms: u64,
        tx: &mut dyn RaftTransport,
        pool: &mut StoragePool,
    ) -> Result<(), RaftError> {
        let mut applier = PoolApplier { pool, applied: 0 };
        let result = self.raft.receive(bytes, now_ms, tx, &mut applier);
        self.applied_entries += applier.applied;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_payload_round_trips() {
        let payload = encode_write("vol0", 0x1000, b"DATA");
        assert_eq!(payload.len(), 64 + 8 + 4 + 4);
        let (name, offset, data) = decode_write(&payload).unwrap();
        assert_eq!(name, "vol0");
        assert_eq!(offset, 0x1000);
        assert_eq!(data, b"DATA");
    }

    #[test]
    fn long_names_are_truncated_not_overflowed() {
        let long = "v".repeat(100);
        let payload = encode_write(&long, 0, b"x");
        let (name, _, _) = decode_write(&payload).unwrap();
        assert_eq!(name.len(), 63);
    }
}
