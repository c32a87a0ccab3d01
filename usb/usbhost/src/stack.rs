//! The host stack context object.
//!
//! One [`UsbStack`] owns every registry the stack needs: the controllers and
//! their address maps, the device arena, the driver table and the active hub
//! list, all behind a single structural mutex. The DMA chunk pool keeps its
//! own lock so buffer traffic never contends with tree surgery.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::debug;
use serde::Deserialize;

use common::dma::DmaMapper;
use common::pool::DmaPool;

use crate::dev::{DeviceId, DeviceNode, LocationId, Speed};
use crate::driver::{DriverId, DriverReg};
use crate::error::{Error, Result};
use crate::hcd::{Completion, CompletionSink, ControllerId, HcOps, HostController};
use crate::ipc::DriverRequest;

/// Tunables of a stack instance, loadable from TOML.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StackConfig {
    /// Hub poll period; root hubs have no interrupt pipe and are only
    /// sampled this often.
    pub poll_interval_ms: u64,
    /// Worker threads draining the driver request channel.
    pub ipc_workers: usize,
    pub reset_retries: u32,
    pub reset_retry_ms: u64,
    /// Cap on the per-hub port count; also the largest port number a
    /// location id tier can carry.
    pub max_hub_ports: u8,
    /// How long an external driver gets to answer an insertion offer.
    pub insertion_reply_ms: u64,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            ipc_workers: 2,
            reset_retries: 5,
            reset_retry_ms: 100,
            max_hub_ports: 15,
            insertion_reply_ms: 1000,
        }
    }
}

impl StackConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|err| Error::Config(err.to_string()))
    }
}

pub(crate) struct StackInner {
    pub controllers: Vec<HostController>,
    pub devices: BTreeMap<DeviceId, DeviceNode>,
    pub next_device: u32,
    pub drivers: BTreeMap<DriverId, DriverReg>,
    pub next_driver: u32,
    /// Hubs the poller watches, root hubs included.
    pub hubs: Vec<DeviceId>,
    /// Set whenever the hub list is mutated mid-scan; tells the poller to
    /// restart from the head instead of walking a stale iteration.
    pub hub_scan_restart: bool,
}

pub struct UsbStack {
    pub(crate) cfg: StackConfig,
    pub(crate) pool: DmaPool,
    pub(crate) inner: Mutex<StackInner>,
    /// Signalled by hub status completions and shutdown; paired with `inner`.
    pub(crate) hub_event: Condvar,

    completion_tx: Sender<Completion>,
    completion_rx: Receiver<Completion>,
    request_tx: Sender<DriverRequest>,
    request_rx: Receiver<DriverRequest>,

    pub(crate) insertion_waiters: Mutex<BTreeMap<u64, Sender<bool>>>,
    pub(crate) next_token: AtomicU64,

    shutdown: AtomicBool,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl UsbStack {
    pub fn new(cfg: StackConfig, mapper: Arc<dyn DmaMapper>) -> Arc<Self> {
        let (completion_tx, completion_rx) = unbounded();
        let (request_tx, request_rx) = unbounded();
        Arc::new(Self {
            cfg,
            pool: DmaPool::new(mapper),
            inner: Mutex::new(StackInner {
                controllers: Vec::new(),
                devices: BTreeMap::new(),
                next_device: 0,
                drivers: BTreeMap::new(),
                next_driver: 0,
                hubs: Vec::new(),
                hub_scan_restart: false,
            }),
            hub_event: Condvar::new(),
            completion_tx,
            completion_rx,
            request_tx,
            request_rx,
            insertion_waiters: Mutex::new(BTreeMap::new()),
            next_token: AtomicU64::new(1),
            shutdown: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &StackConfig {
        &self.cfg
    }

    pub fn pool(&self) -> &DmaPool {
        &self.pool
    }

    /// Channel external transports feed driver requests into. Replies travel
    /// over the per-request reply sender.
    pub fn request_sender(&self) -> Sender<DriverRequest> {
        self.request_tx.clone()
    }

    /// Register one host controller and enumerate its root hub. A failure
    /// anywhere aborts only this controller.
    ///
    /// Root-hub enumeration issues blocking transfers, so [`start`] must
    /// already have spun up the completion dispatcher.
    pub fn add_controller(&self, ops: Arc<dyn HcOps>) -> Result<ControllerId> {
        ops.init(CompletionSink::new(self.completion_tx.clone()))?;

        let id = {
            let mut inner = self.inner.lock().unwrap();
            inner.controllers.push(HostController {
                ops,
                addrs: crate::hcd::AddressMap::new(),
                root: None,
            });
            inner.controllers.len() - 1
        };

        match self.attach_device(id, None, Speed::High) {
            Ok(root) => {
                self.inner.lock().unwrap().controllers[id].root = Some(root);
                Ok(id)
            }
            Err(err) => {
                let mut inner = self.inner.lock().unwrap();
                // add_controller is the only place controllers are pushed, so
                // the failed one is still last.
                inner.controllers.pop();
                Err(err)
            }
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.hub_event.notify_all();
        let threads = std::mem::take(&mut *self.threads.lock().unwrap());
        for handle in threads {
            let _ = handle.join();
        }
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub(crate) fn controller_ops(&self, controller: ControllerId) -> Result<Arc<dyn HcOps>> {
        let inner = self.inner.lock().unwrap();
        inner
            .controllers
            .get(controller)
            .map(|ctl| Arc::clone(&ctl.ops))
            .ok_or(Error::Invalid("unknown controller"))
    }

    pub fn root_device(&self, controller: ControllerId) -> Option<DeviceId> {
        self.inner
            .lock()
            .unwrap()
            .controllers
            .get(controller)
            .and_then(|ctl| ctl.root)
    }

    pub fn device_by_location(
        &self,
        controller: ControllerId,
        location: LocationId,
    ) -> Option<DeviceId> {
        let inner = self.inner.lock().unwrap();
        inner
            .devices
            .values()
            .find(|node| node.controller == controller && node.location == location)
            .map(|node| node.id)
    }

    pub fn devices(&self) -> Vec<DeviceId> {
        self.inner.lock().unwrap().devices.keys().copied().collect()
    }

    pub fn device_snapshot(&self, dev: DeviceId) -> Option<DeviceSnapshot> {
        let inner = self.inner.lock().unwrap();
        let node = inner.devices.get(&dev)?;
        Some(DeviceSnapshot {
            id: node.id,
            controller: node.controller,
            address: node.address,
            speed: node.speed,
            location: node.location,
            parent: node.parent,
            class: node.desc.class,
            vendor: node.desc.vendor,
            product: node.desc.product,
            manufacturer: node.manufacturer.clone(),
            product_str: node.product.clone(),
            serial: node.serial.clone(),
            is_hub: node.hub.is_some(),
            interfaces: node
                .interfaces
                .iter()
                .map(|iface| InterfaceSnapshot {
                    class: iface.desc.class,
                    sub_class: iface.desc.sub_class,
                    protocol: iface.desc.protocol,
                    string: iface.string.clone(),
                    endpoints: iface.endpoints.len(),
                    driver: iface.driver,
                })
                .collect(),
        })
    }
}

/// Spawn the stack's threads: the completion dispatcher, the hub poller and
/// the IPC worker pool. Must run before the first controller is added.
pub fn start(stack: &Arc<UsbStack>) {
    let mut threads = stack.threads.lock().unwrap();

    let dispatcher = Arc::clone(stack);
    threads.push(thread::spawn(move || {
        debug!("completion dispatcher running");
        while !dispatcher.is_shutdown() {
            match dispatcher
                .completion_rx
                .recv_timeout(Duration::from_millis(100))
            {
                Ok(completion) => dispatcher.dispatch_completion(completion),
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }
        }
    }));

    let poller = Arc::clone(stack);
    threads.push(thread::spawn(move || {
        debug!("hub poller running");
        poller.run_hub_poller();
    }));

    for worker in 0..stack.cfg.ipc_workers {
        let stack = Arc::clone(stack);
        threads.push(thread::spawn(move || {
            debug!("ipc worker {worker} running");
            while !stack.is_shutdown() {
                match stack.request_rx.recv_timeout(Duration::from_millis(100)) {
                    Ok(request) => stack.handle_request(request),
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                }
            }
        }));
    }
}

/// Read-only view of a device node, for diagnostics and tests.
#[derive(Clone, Debug)]
pub struct DeviceSnapshot {
    pub id: DeviceId,
    pub controller: ControllerId,
    pub address: u8,
    pub speed: Speed,
    pub location: LocationId,
    pub parent: Option<(DeviceId, u8)>,
    pub class: u8,
    pub vendor: u16,
    pub product: u16,
    pub manufacturer: Option<String>,
    pub product_str: Option<String>,
    pub serial: Option<String>,
    pub is_hub: bool,
    pub interfaces: Vec<InterfaceSnapshot>,
}

#[derive(Clone, Debug)]
pub struct InterfaceSnapshot {
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    pub string: Option<String>,
    pub endpoints: usize,
    pub driver: Option<DriverId>,
}
