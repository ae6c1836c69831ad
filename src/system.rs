//! The long-lived `System` value.
//!
//! Owns the filesystem and the network stack and is handed to the active UI
//! activity by mutable reference, so activities work through capabilities
//! instead of reaching for globals. Generic over the storage and network
//! devices so the whole UI layer runs against mocks in tests.

use crate::fs::{BlockDevice, TinyFs};
use crate::net::{NetDevice, NetStack};

pub struct System<D: BlockDevice, N: NetDevice> {
    pub fs: TinyFs<D>,
    pub net: NetStack,
    pub netdev: N,
    /// Disk capacity in sectors, captured at boot
    pub disk_sectors: u64,
}

impl<D: BlockDevice, N: NetDevice> System<D, N> {
    pub fn new(fs: TinyFs<D>, net: NetStack, netdev: N, disk_sectors: u64) -> Self {
        System {
            fs,
            net,
            netdev,
            disk_sectors,
        }
    }
}
