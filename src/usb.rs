use async_trait::async_trait;
use bytes::Bytes;
use rusb::{DeviceHandle, Direction, GlobalContext, UsbContext};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    error::{Result, TrainerError},
    message::{Message, FRAME_OVERHEAD, SYNC},
    messenger::ListenerRegistry,
    types::{StickInfo, UsbConfig},
};

/// Raw-frame listener. Called on the transport's reader context with one
/// complete frame (sync byte through checksum); must not block.
pub type FrameListener = dyn Fn(&[u8]) + Send + Sync;

/// Byte pipe to an ANT radio
///
/// Implementations deliver every inbound frame to the registered frame
/// listeners and accept complete outbound frames through [`send`](Self::send).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Bring the link up. Calling `start` on a running transport is a no-op.
    async fn start(&self) -> Result<()>;

    /// Tear the link down. Calling `stop` on a stopped transport is a no-op.
    async fn stop(&self) -> Result<()>;

    /// Write one complete frame
    async fn send(&self, frame: Bytes) -> Result<()>;

    /// Whether the link is up
    fn is_running(&self) -> bool;

    /// Register a frame listener (lookup-only; the caller keeps it alive)
    fn add_frame_listener(&self, listener: &Arc<FrameListener>);

    /// Unregister a frame listener
    fn remove_frame_listener(&self, listener: &Arc<FrameListener>) -> bool;
}

/// Zero bytes written after claiming the interface; the stick ignores the
/// first few commands unless something is written to it first.
const WAKE_LEN: usize = 128;

/// List every attached ANT stick matching `config`
///
/// # Errors
///
/// Returns [`TrainerError::Usb`] if the USB device list cannot be read.
pub fn scan_devices(config: &UsbConfig) -> Result<Vec<StickInfo>> {
    let mut sticks = Vec::new();
    for device in rusb::devices()?.iter() {
        let Ok(descriptor) = device.device_descriptor() else {
            continue;
        };
        if config.matches(descriptor.vendor_id(), descriptor.product_id()) {
            sticks.push(StickInfo {
                bus: device.bus_number(),
                address: device.address(),
                vendor_id: descriptor.vendor_id(),
                product_id: descriptor.product_id(),
            });
        }
    }
    debug!("Found {} ANT stick(s)", sticks.len());
    Ok(sticks)
}

struct Link {
    handle: Arc<DeviceHandle<GlobalContext>>,
    endpoint_in: u8,
    endpoint_out: u8,
    write_lock: Arc<Mutex<()>>,
    reader: Option<JoinHandle<()>>,
}

/// ANT USB stick driven through libusb
pub struct UsbTransport {
    config: UsbConfig,
    info: StickInfo,
    idle: Mutex<Option<DeviceHandle<GlobalContext>>>,
    link: Mutex<Option<Link>>,
    lifecycle: tokio::sync::Mutex<()>,
    listeners: Arc<ListenerRegistry<FrameListener>>,
    running: Arc<AtomicBool>,
}

impl UsbTransport {
    /// Open the stick selected by `config.device_index`
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::TransportUnavailable`] if no matching stick exists
    /// at that index or it cannot be opened.
    pub fn open(config: UsbConfig) -> Result<Self> {
        let device = rusb::devices()?
            .iter()
            .filter(|device| {
                device
                    .device_descriptor()
                    .is_ok_and(|d| config.matches(d.vendor_id(), d.product_id()))
            })
            .nth(config.device_index)
            .ok_or_else(|| {
                TrainerError::TransportUnavailable(format!(
                    "no ANT stick at index {}",
                    config.device_index
                ))
            })?;

        let descriptor = device.device_descriptor()?;
        let info = StickInfo {
            bus: device.bus_number(),
            address: device.address(),
            vendor_id: descriptor.vendor_id(),
            product_id: descriptor.product_id(),
        };
        let handle = device
            .open()
            .map_err(|e| unavailable(&format!("cannot open {info}"), e))?;
        info!("Opened ANT stick {}", info);

        Ok(Self {
            config,
            info,
            idle: Mutex::new(Some(handle)),
            link: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            listeners: Arc::new(ListenerRegistry::new()),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Stick this transport was opened on
    #[must_use]
    pub const fn info(&self) -> &StickInfo {
        &self.info
    }

    fn link(&self) -> MutexGuard<'_, Option<Link>> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn idle(&self) -> MutexGuard<'_, Option<DeviceHandle<GlobalContext>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn write(&self, frame: Bytes) -> Result<()> {
        let (handle, endpoint, write_lock) = {
            let link = self.link();
            let link = link.as_ref().ok_or_else(|| {
                TrainerError::TransportUnavailable("transport not started".to_string())
            })?;
            (link.handle.clone(), link.endpoint_out, link.write_lock.clone())
        };
        let timeout = Duration::from_millis(self.config.write_timeout_ms);

        trace!("USB write: {:02X?}", &frame[..]);
        tokio::task::spawn_blocking(move || {
            let _guard = write_lock.lock().unwrap_or_else(PoisonError::into_inner);
            handle.write_bulk(endpoint, &frame, timeout)
        })
        .await
        .map_err(|e| TrainerError::Io(std::io::Error::other(e)))??;
        Ok(())
    }
}

#[async_trait]
impl Transport for UsbTransport {
    async fn start(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_running() {
            return Ok(());
        }

        let mut handle = self.idle().take().ok_or_else(|| {
            TrainerError::TransportUnavailable("device handle was released".to_string())
        })?;
        let interface = self.config.interface;
        let timeout = Duration::from_millis(self.config.write_timeout_ms);

        let (handle, claimed) = tokio::task::spawn_blocking(move || {
            let claimed = claim(&mut handle, interface, timeout);
            (handle, claimed)
        })
        .await
        .map_err(|e| TrainerError::Io(std::io::Error::other(e)))?;

        let (endpoint_in, endpoint_out) = match claimed {
            Ok(endpoints) => endpoints,
            Err(e) => {
                *self.idle() = Some(handle);
                return Err(e);
            }
        };

        let handle = Arc::new(handle);
        self.running.store(true, Ordering::SeqCst);
        let reader = spawn_reader(
            handle.clone(),
            endpoint_in,
            self.config.read_buffer_len,
            Duration::from_millis(self.config.read_timeout_ms),
            self.running.clone(),
            self.listeners.clone(),
        );
        let reader = match reader {
            Ok(reader) => reader,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                if let Ok(mut handle) = Arc::try_unwrap(handle) {
                    if let Err(release) = handle.release_interface(interface) {
                        warn!("Failed to release interface: {}", release);
                    }
                    *self.idle() = Some(handle);
                }
                return Err(e);
            }
        };

        *self.link() = Some(Link {
            handle,
            endpoint_in,
            endpoint_out,
            write_lock: Arc::new(Mutex::new(())),
            reader: Some(reader),
        });
        info!(
            "USB transport started (in {:#04X}, out {:#04X})",
            endpoint_in, endpoint_out
        );
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if !self.is_running() {
            return Ok(());
        }

        self.running.store(false, Ordering::SeqCst);
        // A pending bulk read only returns once the stick sends something.
        if let Err(e) = self.write(Message::reset_system().encode()).await {
            debug!("Reset on stop failed: {}", e);
        }

        let Some(mut link) = self.link().take() else {
            return Ok(());
        };
        if let Some(reader) = link.reader.take() {
            tokio::task::spawn_blocking(move || {
                if reader.join().is_err() {
                    error!("USB reader thread panicked");
                }
            })
            .await
            .map_err(|e| TrainerError::Io(std::io::Error::other(e)))?;
        }

        match Arc::try_unwrap(link.handle) {
            Ok(mut handle) => {
                if let Err(e) = handle.release_interface(self.config.interface) {
                    warn!("Failed to release interface: {}", e);
                }
                *self.idle() = Some(handle);
            }
            Err(_) => warn!("USB handle still shared after stop; it will close when dropped"),
        }
        debug!("Released endpoint {:#04X}", link.endpoint_in);
        info!("USB transport stopped");
        Ok(())
    }

    async fn send(&self, frame: Bytes) -> Result<()> {
        if !self.is_running() {
            return Err(TrainerError::TransportUnavailable(
                "transport not running, call start() first".to_string(),
            ));
        }
        self.write(frame).await
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn add_frame_listener(&self, listener: &Arc<FrameListener>) {
        self.listeners.register(listener);
    }

    fn remove_frame_listener(&self, listener: &Arc<FrameListener>) -> bool {
        self.listeners.unregister(listener)
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Map a USB failure during open or claim to `TransportUnavailable`
fn unavailable(context: &str, e: rusb::Error) -> TrainerError {
    TrainerError::TransportUnavailable(format!("{context}: {e}"))
}

fn claim<T: UsbContext>(
    handle: &mut DeviceHandle<T>,
    interface: u8,
    timeout: Duration,
) -> Result<(u8, u8)> {
    let config = handle
        .device()
        .active_config_descriptor()
        .map_err(|e| unavailable("cannot read USB configuration", e))?;
    let endpoints: Vec<(u8, Direction)> = config
        .interfaces()
        .find(|candidate| candidate.number() == interface)
        .and_then(|candidate| candidate.descriptors().next())
        .map(|descriptor| {
            descriptor
                .endpoint_descriptors()
                .map(|endpoint| (endpoint.address(), endpoint.direction()))
                .collect()
        })
        .ok_or_else(|| {
            TrainerError::TransportUnavailable(format!("interface {interface} not found"))
        })?;
    let (endpoint_in, endpoint_out) = pick_endpoints(&endpoints)?;

    if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
        debug!("Kernel driver auto-detach unavailable: {}", e);
    }
    handle
        .claim_interface(interface)
        .map_err(|e| unavailable(&format!("cannot claim interface {interface}"), e))?;

    if let Err(e) = handle.write_bulk(endpoint_out, &[0u8; WAKE_LEN], timeout) {
        debug!("Wake-up write failed: {}", e);
    }
    Ok((endpoint_in, endpoint_out))
}

/// Select the bulk endpoint pair; exactly one IN and one OUT are required
fn pick_endpoints(endpoints: &[(u8, Direction)]) -> Result<(u8, u8)> {
    if endpoints.len() != 2 {
        return Err(TrainerError::TransportUnavailable(format!(
            "unexpected number of endpoints: {}",
            endpoints.len()
        )));
    }
    let find = |wanted: Direction| {
        endpoints
            .iter()
            .find(|(_, direction)| *direction == wanted)
            .map(|(address, _)| *address)
    };
    match (find(Direction::In), find(Direction::Out)) {
        (Some(endpoint_in), Some(endpoint_out)) => Ok((endpoint_in, endpoint_out)),
        _ => Err(TrainerError::TransportUnavailable(
            "endpoints not found".to_string(),
        )),
    }
}

fn spawn_reader(
    handle: Arc<DeviceHandle<GlobalContext>>,
    endpoint: u8,
    buffer_len: usize,
    timeout: Duration,
    running: Arc<AtomicBool>,
    listeners: Arc<ListenerRegistry<FrameListener>>,
) -> Result<JoinHandle<()>> {
    let reader = thread::Builder::new()
        .name("ant-usb-reader".to_string())
        .spawn(move || {
            let mut buffer = vec![0u8; buffer_len];
            while running.load(Ordering::SeqCst) {
                match handle.read_bulk(endpoint, &mut buffer, timeout) {
                    Ok(read) => {
                        trace!("USB read: {:02X?}", &buffer[..read]);
                        for frame in split_frames(&buffer[..read]) {
                            listeners.notify(|listener| listener(frame));
                        }
                    }
                    Err(rusb::Error::Timeout) => {}
                    Err(e) => {
                        if running.load(Ordering::SeqCst) {
                            error!("USB read failed, reader exiting: {}", e);
                        }
                        break;
                    }
                }
            }
            debug!("USB reader stopped");
        })?;
    Ok(reader)
}

/// Split one USB read into the complete frames it holds.
///
/// Each frame's extent comes from its own length byte. Bytes before a sync
/// byte and an incomplete trailing frame are dropped.
pub(crate) fn split_frames(buffer: &[u8]) -> Vec<&[u8]> {
    let mut frames = Vec::new();
    let mut pos = 0;
    while pos < buffer.len() {
        if buffer[pos] != SYNC {
            let skipped = buffer[pos..]
                .iter()
                .position(|&b| b == SYNC)
                .unwrap_or(buffer.len() - pos);
            warn!("Dropped {} byte(s) outside any frame", skipped);
            pos += skipped;
            continue;
        }
        let Some(&len) = buffer.get(pos + 1) else {
            warn!("Dropped truncated frame header");
            break;
        };
        let end = pos + usize::from(len) + FRAME_OVERHEAD;
        if end > buffer.len() {
            warn!(
                "Dropped truncated frame: {} of {} byte(s)",
                buffer.len() - pos,
                end - pos
            );
            break;
        }
        frames.push(&buffer[pos..end]);
        pos = end;
    }
    frames
}
