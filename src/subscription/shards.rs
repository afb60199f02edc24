// =============================================================================
// Shard Table — bounded WebSocket connection slots
// =============================================================================
//
// The vendor allows at most 5 concurrent feed connections with 5000
// instruments each. Assignment is deterministic first-fit so the fabric
// and the ingestor always agree on shard ids.
// =============================================================================

use serde::Serialize;

pub const SHARD_COUNT: usize = 5;
pub const SHARD_CAPACITY: u32 = 5_000;

#[derive(Debug, Clone, Serialize)]
pub struct ShardUsage {
    pub ws_id: u8,
    pub used: u32,
    pub capacity: u32,
}

/// Plain counters; the fabric holds this inside its own lock.
#[derive(Debug, Clone)]
pub struct ShardTable {
    usage: [u32; SHARD_COUNT],
    capacity: u32,
}

impl ShardTable {
    pub fn new() -> Self {
        Self::with_capacity(SHARD_CAPACITY)
    }

    pub fn with_capacity(capacity: u32) -> Self {
        Self {
            usage: [0; SHARD_COUNT],
            capacity,
        }
    }

    /// First shard (1-based) with a free slot, if any.
    pub fn first_fit(&self) -> Option<u8> {
        self.usage
            .iter()
            .position(|&used| used < self.capacity)
            .map(|i| (i + 1) as u8)
    }

    /// Occupy a slot on the first free shard and return its id.
    pub fn occupy_first_fit(&mut self) -> Option<u8> {
        let ws_id = self.first_fit()?;
        self.usage[(ws_id - 1) as usize] += 1;
        Some(ws_id)
    }

    /// Occupy a slot on a specific shard (rehydration path). Falls back to
    /// first-fit when that shard is full.
    pub fn occupy(&mut self, ws_id: u8) -> Option<u8> {
        let idx = ws_id.clamp(1, SHARD_COUNT as u8) as usize - 1;
        if self.usage[idx] < self.capacity {
            self.usage[idx] += 1;
            Some((idx + 1) as u8)
        } else {
            self.occupy_first_fit()
        }
    }

    pub fn release(&mut self, ws_id: u8) {
        let idx = ws_id.clamp(1, SHARD_COUNT as u8) as usize - 1;
        self.usage[idx] = self.usage[idx].saturating_sub(1);
    }

    pub fn total(&self) -> u32 {
        self.usage.iter().sum()
    }

    pub fn is_full(&self) -> bool {
        self.first_fit().is_none()
    }

    pub fn snapshot(&self) -> Vec<ShardUsage> {
        self.usage
            .iter()
            .enumerate()
            .map(|(i, &used)| ShardUsage {
                ws_id: (i + 1) as u8,
                used,
                capacity: self.capacity,
            })
            .collect()
    }
}

impl Default for ShardTable {
    fn default() -> Self {
        Self::new()
    }
}
