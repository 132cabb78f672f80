// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 scobridge contributors

//! Process-wide adapter/device/transport registry.
//!
//! The [`Bridge`] owns the mapping from adapters to dispatcher threads and
//! from transports to I/O threads, with explicit init/teardown instead of
//! hidden module state. The control plane registers devices (keyed by
//! Bluetooth address) and their transports (keyed by the owning object
//! path); dispatchers resolve inbound links through the same maps.

use crate::dispatcher::{self, DispatcherHandle};
use crate::sco::BdAddr;
use crate::transport::{io_loop, ScoIoHandle, Transport};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// One local Bluetooth adapter.
#[derive(Debug, Clone)]
pub struct Adapter {
    /// Kernel device id (the N in `hciN`).
    pub dev_id: u16,
    /// Kernel device name, for logging.
    pub name: String,
    /// Adapter Bluetooth address; the dispatcher socket binds to it.
    pub address: BdAddr,
    /// Bluetooth SIG company identifier of the chip, for vendor quirks.
    pub manufacturer: u16,
}

/// One remote device and its registered transports.
#[derive(Debug)]
pub struct Device {
    address: BdAddr,
    owner_path: String,
    transports: DashMap<String, Arc<Transport>>,
}

impl Device {
    /// Register a device seen under `owner_path` (the controlling
    /// object path of the control plane).
    pub fn new(address: BdAddr, owner_path: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            address,
            owner_path: owner_path.into(),
            transports: DashMap::new(),
        })
    }

    /// Remote Bluetooth address.
    #[must_use]
    pub fn address(&self) -> BdAddr {
        self.address
    }

    /// Controlling object path this device was registered under.
    #[must_use]
    pub fn owner_path(&self) -> &str {
        &self.owner_path
    }

    /// Register a transport under `path`.
    pub fn insert_transport(&self, path: impl Into<String>, transport: Arc<Transport>) {
        self.transports.insert(path.into(), transport);
    }

    /// Drop the transport registered under `path`.
    pub fn remove_transport(&self, path: &str) -> Option<Arc<Transport>> {
        self.transports.remove(path).map(|(_, t)| t)
    }

    /// Find the transport registered under `path`.
    #[must_use]
    pub fn transport_lookup(&self, path: &str) -> Option<Arc<Transport>> {
        self.transports.get(path).map(|t| Arc::clone(&t))
    }
}

/// Device directory shared with the dispatcher threads. Inbound links
/// are resolved against it by [`dispatch_link`].
///
/// [`dispatch_link`]: crate::dispatcher::dispatch_link
#[derive(Debug, Default)]
pub struct Directory {
    devices: DashMap<BdAddr, Arc<Device>>,
}

impl Directory {
    /// Find a device by remote Bluetooth address.
    #[must_use]
    pub fn device_lookup(&self, address: BdAddr) -> Option<Arc<Device>> {
        self.devices.get(&address).map(|d| Arc::clone(&d))
    }
}

/// Process-wide registry of dispatcher and I/O threads.
pub struct Bridge {
    directory: Arc<Directory>,
    dispatchers: Mutex<HashMap<u16, DispatcherHandle>>,
    io_threads: Mutex<HashMap<usize, ScoIoHandle>>,
}

impl Bridge {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            directory: Arc::new(Directory::default()),
            dispatchers: Mutex::new(HashMap::new()),
            io_threads: Mutex::new(HashMap::new()),
        }
    }

    /// Make a device findable by the dispatchers.
    pub fn register_device(&self, device: Arc<Device>) {
        self.directory.devices.insert(device.address(), device);
    }

    /// Remove a device; links already attached stay with their transports.
    pub fn remove_device(&self, address: BdAddr) -> Option<Arc<Device>> {
        self.directory.devices.remove(&address).map(|(_, d)| d)
    }

    /// Find a device by remote Bluetooth address.
    #[must_use]
    pub fn device_lookup(&self, address: BdAddr) -> Option<Arc<Device>> {
        self.directory.device_lookup(address)
    }

    /// The device directory the dispatchers resolve inbound links
    /// against.
    #[must_use]
    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    /// Start the connection dispatcher for `adapter`. Starting an adapter
    /// whose dispatcher is already running is a no-op.
    pub fn start_dispatcher(&self, adapter: Adapter) -> crate::Result<()> {
        let mut dispatchers = self.dispatchers.lock();
        if let Some(handle) = dispatchers.get(&adapter.dev_id) {
            if handle.is_running() {
                return Ok(());
            }
        }
        let handle = dispatcher::spawn(adapter.clone(), Arc::clone(&self.directory))?;
        dispatchers.insert(adapter.dev_id, handle);
        Ok(())
    }

    /// Stop and forget the dispatcher of `dev_id`.
    pub fn stop_dispatcher(&self, dev_id: u16) {
        let handle = self.dispatchers.lock().remove(&dev_id);
        if let Some(mut handle) = handle {
            handle.stop();
        }
    }

    /// Start the I/O thread of `transport`. At most one I/O thread runs
    /// per transport; starting a transport that already has one is a
    /// no-op.
    pub fn start_io(&self, transport: &Arc<Transport>) -> crate::Result<()> {
        let key = Arc::as_ptr(transport) as usize;
        let mut io_threads = self.io_threads.lock();
        if let Some(handle) = io_threads.get(&key) {
            if handle.is_running() {
                return Ok(());
            }
        }
        let handle = io_loop::spawn(Arc::clone(transport))?;
        io_threads.insert(key, handle);
        Ok(())
    }

    /// Stop and forget the I/O thread of `transport`.
    pub fn stop_io(&self, transport: &Arc<Transport>) {
        let key = Arc::as_ptr(transport) as usize;
        let handle = self.io_threads.lock().remove(&key);
        if let Some(mut handle) = handle {
            handle.stop();
        }
    }

    /// Tear everything down: dispatchers first (no new links arrive),
    /// then the transport I/O threads.
    pub fn shutdown(&self) {
        let dispatchers: Vec<_> = self.dispatchers.lock().drain().collect();
        for (_, mut handle) in dispatchers {
            handle.stop();
        }
        let io_threads: Vec<_> = self.io_threads.lock().drain().collect();
        for (_, mut handle) in io_threads {
            handle.stop();
        }
    }
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}
