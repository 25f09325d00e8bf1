//! Generic ESC/POS driver over raw TCP or a Bluetooth SPP / serial link.

use std::collections::{BTreeSet, HashMap};
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serialport::{SerialPort, SerialPortType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::tags::{column_gaps, parse};
use super::{is_printer_like_name, DeviceSignal, PrinterDriver, ProbeStatus, ESCPOS_DRIVER_ID};
use crate::error::PrinterError;
use crate::escpos::{auto_recoverable_error, paper_end, EscPosBuilder, PaperWidth, StatusRequest};
use crate::markup::{MarkupLine, Span};

const DEFAULT_TCP_PORT: u16 = 9100;

#[derive(Debug, Clone)]
pub struct EscPosOptions {
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
    /// How long to wait for a real-time status byte before assuming the
    /// printer simply does not answer status requests.
    pub status_timeout: Duration,
    pub baud_rate: u32,
}

impl Default for EscPosOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            write_timeout: Duration::from_secs(2),
            status_timeout: Duration::from_millis(500),
            baud_rate: 9600,
        }
    }
}

// ---------------------------------------------------------------------------
// Address resolution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Endpoint {
    Tcp(String),
    Serial(String),
    BluetoothMac(String),
}

fn is_mac_address(s: &str) -> bool {
    let parts: Vec<&str> = s.split([':', '-']).collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

fn parse_endpoint(address: &str) -> Result<Endpoint, PrinterError> {
    let address = address.trim();
    if address.is_empty() {
        return Err(PrinterError::InvalidAddress("empty address".into()));
    }
    if is_mac_address(address) {
        return Ok(Endpoint::BluetoothMac(address.to_uppercase()));
    }
    if let Some((host, port)) = address.rsplit_once(':') {
        if !host.is_empty() && !host.contains(':') && port.parse::<u16>().is_ok() {
            return Ok(Endpoint::Tcp(address.to_string()));
        }
    }
    let looks_like_device = address.starts_with('/')
        || address.to_uppercase().starts_with("COM")
        || address.contains("rfcomm");
    if looks_like_device {
        return Ok(Endpoint::Serial(address.to_string()));
    }
    // bare host name or IP
    Ok(Endpoint::Tcp(format!("{address}:{DEFAULT_TCP_PORT}")))
}

/// Find the serial device a paired printer's MAC was bound to.
fn serial_path_for_mac(mac: &str) -> Result<String, PrinterError> {
    let compact: String = mac.chars().filter(|c| c.is_ascii_hexdigit()).collect();
    let compact = compact.to_lowercase();
    let ports = serialport::available_ports()?;
    ports
        .into_iter()
        .find(|p| {
            let name: String = p.port_name.to_lowercase().replace([':', '-', '_'], "");
            name.contains(&compact)
        })
        .map(|p| p.port_name)
        .ok_or_else(|| PrinterError::InvalidAddress(format!("no serial port bound to {mac}")))
}

// ---------------------------------------------------------------------------
// Links
// ---------------------------------------------------------------------------

enum Link {
    Tcp(TcpStream),
    Serial(Arc<Mutex<Box<dyn SerialPort>>>),
}

impl Link {
    async fn write_all(&mut self, data: &[u8], timeout: Duration) -> Result<(), PrinterError> {
        match self {
            Link::Tcp(stream) => {
                let write = async {
                    stream.write_all(data).await?;
                    stream.flush().await
                };
                tokio::time::timeout(timeout, write)
                    .await
                    .map_err(|_| PrinterError::Transport("write timed out".into()))??;
                Ok(())
            }
            Link::Serial(port) => {
                let port = port.clone();
                let data = data.to_vec();
                tokio::task::spawn_blocking(move || -> Result<(), PrinterError> {
                    let mut guard = port
                        .lock()
                        .map_err(|_| PrinterError::Transport("serial port lock poisoned".into()))?;
                    guard.write_all(&data)?;
                    guard.flush()?;
                    Ok(())
                })
                .await
                .map_err(|e| PrinterError::Transport(e.to_string()))?
            }
        }
    }

    /// Read one status byte. `Ok(None)` means the printer stayed silent.
    async fn read_status(&mut self, timeout: Duration) -> Result<Option<u8>, PrinterError> {
        match self {
            Link::Tcp(stream) => {
                let mut buf = [0u8; 1];
                match tokio::time::timeout(timeout, stream.read(&mut buf)).await {
                    Err(_) => Ok(None),
                    Ok(Ok(0)) => Err(PrinterError::Transport("connection closed by printer".into())),
                    Ok(Ok(_)) => Ok(Some(buf[0])),
                    Ok(Err(e)) => Err(e.into()),
                }
            }
            Link::Serial(port) => {
                let port = port.clone();
                tokio::task::spawn_blocking(move || -> Result<Option<u8>, PrinterError> {
                    let mut guard = port
                        .lock()
                        .map_err(|_| PrinterError::Transport("serial port lock poisoned".into()))?;
                    guard.set_timeout(timeout)?;
                    let mut buf = [0u8; 1];
                    match guard.read(&mut buf) {
                        Ok(0) => Ok(None),
                        Ok(_) => Ok(Some(buf[0])),
                        Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(None),
                        Err(e) => Err(e.into()),
                    }
                })
                .await
                .map_err(|e| PrinterError::Transport(e.to_string()))?
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

type SharedLink = Arc<tokio::sync::Mutex<Link>>;

pub struct EscPosDriver {
    options: EscPosOptions,
    links: Mutex<HashMap<String, SharedLink>>,
}

impl EscPosDriver {
    pub fn new(options: EscPosOptions) -> Self {
        Self {
            options,
            links: Mutex::new(HashMap::new()),
        }
    }

    fn link(&self, address: &str) -> Option<SharedLink> {
        self.links
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(address)
            .cloned()
    }

    fn drop_link(&self, address: &str) {
        self.links
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(address);
    }

    async fn open(&self, address: &str) -> Result<Link, PrinterError> {
        match parse_endpoint(address)? {
            Endpoint::Tcp(addr) => {
                let stream = tokio::time::timeout(self.options.connect_timeout, TcpStream::connect(&addr))
                    .await
                    .map_err(|_| PrinterError::Transport(format!("connect to {addr} timed out")))??;
                stream.set_nodelay(true)?;
                Ok(Link::Tcp(stream))
            }
            Endpoint::Serial(path) => self.open_serial(path).await,
            Endpoint::BluetoothMac(mac) => {
                let path = tokio::task::spawn_blocking(move || serial_path_for_mac(&mac))
                    .await
                    .map_err(|e| PrinterError::Transport(e.to_string()))??;
                self.open_serial(path).await
            }
        }
    }

    async fn open_serial(&self, path: String) -> Result<Link, PrinterError> {
        let baud = self.options.baud_rate;
        let timeout = self.options.write_timeout;
        let port = tokio::task::spawn_blocking(move || {
            serialport::new(&path, baud).timeout(timeout).open()
        })
        .await
        .map_err(|e| PrinterError::Transport(e.to_string()))??;
        Ok(Link::Serial(Arc::new(Mutex::new(port))))
    }

    async fn query_status(
        &self,
        link: &mut Link,
        request: StatusRequest,
    ) -> Result<Option<u8>, PrinterError> {
        let mut b = EscPosBuilder::new(PaperWidth::Mm80);
        b.status_request(request);
        link.write_all(&b.build(), self.options.write_timeout).await?;
        link.read_status(self.options.status_timeout).await
    }
}

#[async_trait]
impl PrinterDriver for EscPosDriver {
    fn id(&self) -> &str {
        ESCPOS_DRIVER_ID
    }

    async fn connect(&self, address: &str) -> bool {
        if self.link(address).is_some() {
            return true;
        }
        match self.open(address).await {
            Ok(link) => {
                self.links
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(address.to_string(), Arc::new(tokio::sync::Mutex::new(link)));
                info!(address, "ESC/POS printer connected");
                true
            }
            Err(e) => {
                warn!(address, error = %e, "ESC/POS connect failed");
                false
            }
        }
    }

    async fn disconnect(&self, address: &str) {
        self.drop_link(address);
        debug!(address, "ESC/POS link closed");
    }

    async fn probe(&self, address: &str) -> ProbeStatus {
        let Some(link) = self.link(address) else {
            return ProbeStatus::Unresponsive;
        };
        let mut link = link.lock().await;

        let paper = match self.query_status(&mut link, StatusRequest::PaperSensor).await {
            Ok(status) => status,
            Err(e) => {
                warn!(address, error = %e, "ESC/POS probe failed");
                drop(link);
                self.drop_link(address);
                return ProbeStatus::Unresponsive;
            }
        };
        if paper.is_some_and(paper_end) {
            return ProbeStatus::Degraded(DeviceSignal::PaperOut);
        }
        if paper.is_none() {
            // Silent printer: the write went through, nothing more to learn.
            return ProbeStatus::Responsive;
        }
        match self.query_status(&mut link, StatusRequest::Error).await {
            Ok(Some(status)) if auto_recoverable_error(status) => {
                ProbeStatus::Degraded(DeviceSignal::Overheated)
            }
            Ok(_) => ProbeStatus::Responsive,
            Err(e) => {
                warn!(address, error = %e, "ESC/POS error-status query failed");
                drop(link);
                self.drop_link(address);
                ProbeStatus::Unresponsive
            }
        }
    }

    async fn send(&self, address: &str, bytes: &[u8]) -> bool {
        let Some(link) = self.link(address) else {
            warn!(address, "ESC/POS send without an open link");
            return false;
        };
        let result = link.lock().await.write_all(bytes, self.options.write_timeout).await;
        match result {
            Ok(()) => {
                debug!(address, bytes = bytes.len(), "ESC/POS payload sent");
                true
            }
            Err(e) => {
                warn!(address, error = %e, "ESC/POS send failed");
                self.drop_link(address);
                false
            }
        }
    }

    async fn discover(&self) -> BTreeSet<String> {
        let ports = tokio::task::spawn_blocking(serialport::available_ports).await;
        let ports = match ports {
            Ok(Ok(ports)) => ports,
            Ok(Err(e)) => {
                warn!(error = %e, "serial port enumeration failed");
                return BTreeSet::new();
            }
            Err(e) => {
                warn!(error = %e, "serial port enumeration task failed");
                return BTreeSet::new();
            }
        };
        ports
            .into_iter()
            .filter(|p| match &p.port_type {
                SerialPortType::BluetoothPort => true,
                SerialPortType::UsbPort(usb) => usb
                    .product
                    .as_deref()
                    .or(usb.manufacturer.as_deref())
                    .is_some_and(is_printer_like_name),
                _ => p.port_name.contains("rfcomm") || is_printer_like_name(&p.port_name),
            })
            .map(|p| p.port_name)
            .collect()
    }

    fn compile(&self, markup: &str, paper: PaperWidth) -> Vec<u8> {
        compile_markup(markup, paper)
    }
}

// ---------------------------------------------------------------------------
// Markup compiler
// ---------------------------------------------------------------------------

/// Compile markup text into an ESC/POS byte stream.
pub fn compile_markup(markup: &str, paper: PaperWidth) -> Vec<u8> {
    let mut b = EscPosBuilder::new(paper);
    b.init();
    for line in parse(markup) {
        match line {
            MarkupLine::Feed(n) => {
                b.feed(n);
            }
            MarkupLine::Cut => {
                b.cut();
            }
            MarkupLine::Row(columns) if columns.len() <= 1 => {
                if let Some(column) = columns.first() {
                    b.align(column.align);
                    for span in &column.spans {
                        emit_span(&mut b, span);
                    }
                }
                b.lf();
            }
            MarkupLine::Row(columns) => {
                b.align(crate::markup::Align::Left);
                let gaps = column_gaps(&columns, paper.chars());
                for (column, gap) in columns.iter().zip(gaps) {
                    b.spaces(gap);
                    for span in &column.spans {
                        emit_span(&mut b, span);
                    }
                }
                b.lf();
            }
        }
    }
    b.build()
}

fn emit_span(b: &mut EscPosBuilder, span: &Span) {
    if span.bold {
        b.bold(true);
    }
    if span.underline {
        b.underline(true);
    }
    if span.big {
        b.double_size(true);
    }
    b.text(&span.text);
    if span.big {
        b.double_size(false);
    }
    if span.underline {
        b.underline(false);
    }
    if span.bold {
        b.bold(false);
    }
}
