//! Modbus TCP slave
//!
//! Register areas are described to the slave once (kind, Modbus start
//! offset, size in bytes, backing [`RegisterBank`]); the slave then serves
//! them with the tokio-modbus server until stopped. Every register access
//! goes through the bank's lock, the same one the increment loop takes.
//!
//! The server runs its own single-threaded runtime on a dedicated thread,
//! so callers stay blocking.

pub mod service;

use crate::config::ModbusSettings;
use crate::error::{Error, Result};
use crate::registers::{RegisterBank, RegisterKind};
use log::*;
use service::RegisterService;
use std::future::{self, Future};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime;
use tokio::sync::oneshot;
use tokio::time::{self, Instant, Sleep};
use tokio_modbus::server::tcp::Server;

/// Simultaneous client connections served
pub const MAX_CONNECTIONS: usize = 5;

/// Matches `CONFIG_PTHREAD_TASK_STACK_SIZE_DEFAULT`
#[cfg(target_os = "espidf")]
const SERVER_STACK_SIZE: usize = 8 * 1024;

/// Describes where one block of registers lives
#[derive(Debug, Clone)]
pub struct RegisterArea {
    pub kind: RegisterKind,
    /// First Modbus address of the area
    pub start_offset: u16,
    /// Size of the area in bytes
    pub size: usize,
    pub bank: Arc<RegisterBank>,
}

impl RegisterArea {
    pub fn new(kind: RegisterKind, start_offset: u16, size: usize, bank: Arc<RegisterBank>) -> Self {
        Self {
            kind,
            start_offset,
            size,
            bank,
        }
    }

    pub fn register_count(&self) -> usize {
        self.size / 2
    }

    /// Map a Modbus address range onto a bank index, if fully inside the area
    pub fn resolve(&self, address: u16, quantity: u16) -> Option<usize> {
        let index = address.checked_sub(self.start_offset)? as usize;
        (index + quantity as usize <= self.register_count()).then_some(index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpAddrType {
    V4,
}

/// Network interface the slave is meant to serve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Netif {
    Ethernet,
    WifiStation,
    WifiAccessPoint,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommInfo {
    pub port: u16,
    pub addr_type: IpAddrType,
    /// Only accept this client; `None` accepts any client
    pub bind_addr: Option<IpAddr>,
    pub netif: Netif,
    /// Disconnect clients that stay silent this long
    pub idle_timeout: Duration,
}

/// A Modbus TCP slave being configured
#[derive(Debug)]
pub struct ModbusSlave {
    areas: Vec<RegisterArea>,
    comm: Option<CommInfo>,
}

impl ModbusSlave {
    pub fn tcp() -> Self {
        Self {
            areas: Vec::new(),
            comm: None,
        }
    }

    pub fn areas(&self) -> &[RegisterArea] {
        &self.areas
    }

    /// Register one area. One area per register kind.
    pub fn set_descriptor(&mut self, area: RegisterArea) -> Result<()> {
        if area.size == 0 || area.size % 2 != 0 {
            return Err(Error::Descriptor("size must be a non-zero number of registers"));
        }
        if area.register_count() > area.bank.len(area.kind) {
            return Err(Error::Descriptor("area is larger than its register block"));
        }
        if area.start_offset as usize + area.register_count() > u16::MAX as usize + 1 {
            return Err(Error::Descriptor("area runs past the Modbus address space"));
        }
        if self.areas.iter().any(|a| a.kind == area.kind) {
            return Err(Error::Descriptor("an area of this kind is already registered"));
        }

        debug!(
            target: "mbnode::modbus",
            "{:?} area: offset {}, {} registers",
            area.kind,
            area.start_offset,
            area.register_count()
        );
        self.areas.push(area);
        Ok(())
    }

    pub fn setup(&mut self, comm: CommInfo) -> Result<()> {
        if self.areas.is_empty() {
            return Err(Error::NotConfigured("register area"));
        }
        self.comm = Some(comm);
        Ok(())
    }

    /// Bind the TCP port and start serving on a background thread
    pub fn start(self) -> Result<SlaveHandle> {
        let comm = self.comm.ok_or(Error::NotConfigured("communication options"))?;

        // Bound here so that a taken port is reported to the caller.
        let listener = std::net::TcpListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), comm.port))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        info!(
            target: "mbnode::modbus",
            "Modbus TCP slave listening on {} ({:?})",
            local_addr,
            comm.netif
        );

        let runtime = runtime::Builder::new_current_thread().enable_all().build()?;
        let areas: Arc<[RegisterArea]> = self.areas.into();
        let active = Arc::new(AtomicUsize::new(0));
        let (stop_tx, stop_rx) = oneshot::channel();

        let server = {
            let active = active.clone();
            server_thread().spawn(move || {
                let served = runtime.block_on(async move {
                    let listener = TcpListener::from_std(listener)?;
                    serve(listener, areas, active, comm, stop_rx).await
                });
                if let Err(e) = served {
                    error!(target: "mbnode::modbus", "Modbus TCP slave failed: {}", e);
                }
            })?
        };

        Ok(SlaveHandle {
            local_addr,
            active,
            stop: Some(stop_tx),
            server: Some(server),
        })
    }
}

/// Running slave. Dropping the handle leaves the slave running.
pub struct SlaveHandle {
    local_addr: SocketAddr,
    active: Arc<AtomicUsize>,
    stop: Option<oneshot::Sender<()>>,
    server: Option<JoinHandle<()>>,
}

impl SlaveHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Close the listener and every client connection
    pub fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(server) = self.server.take() {
            let _ = server.join();
        }
        info!(target: "mbnode::modbus", "Modbus TCP slave stopped");
    }
}

#[cfg(target_os = "espidf")]
fn server_thread() -> thread::Builder {
    thread::Builder::new().name("mb-server".into()).stack_size(SERVER_STACK_SIZE)
}

#[cfg(not(target_os = "espidf"))]
fn server_thread() -> thread::Builder {
    thread::Builder::new().name("mb-server".into())
}

async fn serve(
    listener: TcpListener,
    areas: Arc<[RegisterArea]>,
    active: Arc<AtomicUsize>,
    comm: CommInfo,
    stop: oneshot::Receiver<()>,
) -> io::Result<()> {
    let server = Server::new(listener);

    let on_connected = |stream: TcpStream, peer: SocketAddr| {
        let areas = areas.clone();
        let active = active.clone();
        let only_client = comm.bind_addr;
        let idle_timeout = comm.idle_timeout;
        async move {
            if only_client.is_some_and(|ip| ip != peer.ip()) {
                debug!(target: "mbnode::modbus", "Rejecting client {}", peer);
                return Ok(None);
            }
            if active.load(Ordering::Acquire) >= MAX_CONNECTIONS {
                warn!(target: "mbnode::modbus", "Connection limit reached, rejecting {}", peer);
                return Ok(None);
            }
            stream.set_nodelay(true)?;
            info!(target: "mbnode::modbus", "Client connected: {}", peer);
            let service = RegisterService::for_client(areas, peer, active);
            Ok::<_, io::Error>(Some((service, IdleStream::new(stream, idle_timeout))))
        }
    };
    let on_process_error = |e: io::Error| {
        debug!(target: "mbnode::modbus", "Client error: {}", e);
    };

    // A dropped handle never stops the slave.
    let stop = Box::pin(async move {
        if stop.await.is_err() {
            future::pending::<()>().await;
        }
    });

    server.serve_until(&on_connected, on_process_error, stop).await?;
    Ok(())
}

/// Client stream that fails reads once the peer has been quiet for too long
struct IdleStream {
    inner: TcpStream,
    timeout: Duration,
    deadline: Pin<Box<Sleep>>,
}

impl IdleStream {
    fn new(inner: TcpStream, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            deadline: Box::pin(time::sleep(timeout)),
        }
    }
}

impl AsyncRead for IdleStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                let next = Instant::now() + this.timeout;
                this.deadline.as_mut().reset(next);
                Poll::Ready(result)
            }
            Poll::Pending => match this.deadline.as_mut().poll(cx) {
                Poll::Ready(()) => Poll::Ready(Err(io::Error::new(io::ErrorKind::TimedOut, "idle client"))),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

impl AsyncWrite for IdleStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Bring up the Modbus TCP slave serving `bank` on `netif`.
///
/// Registers the holding and input areas, applies the TCP options (port,
/// IPv4, any client) and starts the slave.
pub fn modbus_slave_init(bank: &Arc<RegisterBank>, settings: &ModbusSettings, netif: Netif) -> Result<SlaveHandle> {
    let mut slave = ModbusSlave::tcp();

    slave.set_descriptor(RegisterArea::new(
        RegisterKind::Holding,
        settings.holding_start,
        settings.holding_count * 2,
        bank.clone(),
    ))?;
    slave.set_descriptor(RegisterArea::new(
        RegisterKind::Input,
        settings.input_start,
        settings.input_count * 2,
        bank.clone(),
    ))?;

    slave.setup(CommInfo {
        port: settings.port,
        addr_type: IpAddrType::V4,
        bind_addr: None,
        netif,
        idle_timeout: settings.idle_timeout,
    })?;

    slave.start()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn holding(size: usize, bank: &Arc<RegisterBank>) -> RegisterArea {
        RegisterArea::new(RegisterKind::Holding, 0, size, bank.clone())
    }

    #[test]
    fn descriptor_validation() {
        let bank = Arc::new(RegisterBank::new());
        let mut slave = ModbusSlave::tcp();
        assert!(matches!(slave.set_descriptor(holding(0, &bank)), Err(Error::Descriptor(_))));
        assert!(matches!(slave.set_descriptor(holding(7, &bank)), Err(Error::Descriptor(_))));
        assert!(matches!(slave.set_descriptor(holding(102, &bank)), Err(Error::Descriptor(_))));
        slave.set_descriptor(holding(100, &bank)).unwrap();
        assert!(matches!(slave.set_descriptor(holding(2, &bank)), Err(Error::Descriptor(_))));
        assert_eq!(slave.areas().len(), 1);
    }

    #[test]
    fn start_requires_setup() {
        let bank = Arc::new(RegisterBank::new());
        let mut slave = ModbusSlave::tcp();
        slave.set_descriptor(holding(100, &bank)).unwrap();
        assert!(matches!(slave.start(), Err(Error::NotConfigured(_))));

        let comm = CommInfo {
            port: 0,
            addr_type: IpAddrType::V4,
            bind_addr: None,
            netif: Netif::Ethernet,
            idle_timeout: Duration::from_secs(1),
        };
        assert!(matches!(ModbusSlave::tcp().setup(comm), Err(Error::NotConfigured(_))));
    }

    #[test]
    fn resolve_respects_offset_and_size() {
        let bank = Arc::new(RegisterBank::new());
        let area = RegisterArea::new(RegisterKind::Input, 100, 20, bank);
        assert_eq!(area.resolve(99, 1), None);
        assert_eq!(area.resolve(100, 10), Some(0));
        assert_eq!(area.resolve(105, 5), Some(5));
        assert_eq!(area.resolve(105, 6), None);
    }
}
