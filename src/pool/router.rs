//! Key to node routing.
//!
//! Keys hash to one of 16384 slots (CRC16/XMODEM, honouring `{hash tags}`),
//! and the slot space is split into contiguous equal ranges across the
//! topology's endpoints in sorted order.

use crate::config::{ClusterTopology, Endpoint};

/// Number of hash slots.
pub const SLOT_COUNT: u16 = 16384;

/// Maps keys to the endpoint that owns them.
#[derive(Debug, Clone)]
pub struct SlotRouter {
    owners: Vec<Endpoint>,
}

impl SlotRouter {
    pub fn new(topology: &ClusterTopology) -> Self {
        Self {
            owners: topology.endpoints().cloned().collect(),
        }
    }

    /// Endpoint owning `key`, or `None` for an empty topology.
    pub fn owner(&self, key: &[u8]) -> Option<&Endpoint> {
        self.owner_of_slot(key_slot(key))
    }

    pub fn owner_of_slot(&self, slot: u16) -> Option<&Endpoint> {
        if self.owners.is_empty() {
            return None;
        }
        let index = slot as usize * self.owners.len() / SLOT_COUNT as usize;
        self.owners.get(index)
    }
}

/// Slot of a key. Only the content of a non-empty `{...}` tag is hashed.
pub fn key_slot(key: &[u8]) -> u16 {
    crc16(hash_tag(key)) % SLOT_COUNT
}

fn hash_tag(key: &[u8]) -> &[u8] {
    if let Some(open) = key.iter().position(|&b| b == b'{') {
        if let Some(len) = key[open + 1..].iter().position(|&b| b == b'}') {
            if len > 0 {
                return &key[open + 1..open + 1 + len];
            }
        }
    }
    key
}

/// CRC16/XMODEM (poly 0x1021, init 0).
fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}
