//! Vendor SDK driver and the null fallback.
//!
//! Vendor SDKs are optional. A [`VendorDriver`] asks its SDK once, at
//! construction, whether it can run on this host; when it cannot (or when no
//! SDK was linked at all) every operation fails deterministically.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::tags::to_plain_text;
use super::{DeviceSignal, PrinterDriver, ProbeStatus, NULL_DRIVER_ID};
use crate::escpos::PaperWidth;

/// Status flags reported by a vendor status query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VendorStatus {
    pub offline: bool,
    pub paper_empty: bool,
    pub head_overheated: bool,
    pub battery_low: bool,
}

impl VendorStatus {
    fn to_probe(self) -> ProbeStatus {
        if self.offline {
            ProbeStatus::Unresponsive
        } else if self.paper_empty {
            ProbeStatus::Degraded(DeviceSignal::PaperOut)
        } else if self.head_overheated {
            ProbeStatus::Degraded(DeviceSignal::Overheated)
        } else if self.battery_low {
            ProbeStatus::Degraded(DeviceSignal::LowBattery)
        } else {
            ProbeStatus::Responsive
        }
    }
}

/// Port-level interface of a vendor printing SDK.
#[async_trait]
pub trait VendorSdk: Send + Sync {
    fn name(&self) -> &str;

    /// One-time capability check.
    fn is_available(&self) -> bool;

    /// MAC addresses of paired printers.
    async fn search_bluetooth(&self) -> Vec<String>;

    async fn open_port(&self, port_name: &str) -> bool;

    async fn close_port(&self, port_name: &str);

    async fn write(&self, port_name: &str, data: &[u8]) -> bool;

    /// `None` when the query itself failed.
    async fn status(&self, port_name: &str) -> Option<VendorStatus>;
}

/// Vendor port name for a printer address.
pub fn port_name(address: &str) -> String {
    let address = address.trim();
    if address.contains(':') && !address.contains('.') && address.split(':').count() == 6 {
        format!("BT:{}", address.to_uppercase())
    } else {
        format!("TCP:{address}")
    }
}

pub struct VendorDriver {
    id: String,
    sdk: Option<Arc<dyn VendorSdk>>,
}

impl VendorDriver {
    /// Resolve the driver once. An SDK that reports itself unavailable is
    /// dropped here and never consulted again.
    pub fn resolve(id: impl Into<String>, sdk: Option<Arc<dyn VendorSdk>>) -> Self {
        let id = id.into();
        let sdk = match sdk {
            Some(sdk) if sdk.is_available() => {
                info!(driver = %id, sdk = sdk.name(), "vendor SDK available");
                Some(sdk)
            }
            Some(sdk) => {
                warn!(driver = %id, sdk = sdk.name(), "vendor SDK failed capability check, driver disabled");
                None
            }
            None => {
                debug!(driver = %id, "no vendor SDK linked, driver disabled");
                None
            }
        };
        Self { id, sdk }
    }
}

#[async_trait]
impl PrinterDriver for VendorDriver {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_available(&self) -> bool {
        self.sdk.is_some()
    }

    async fn connect(&self, address: &str) -> bool {
        let Some(sdk) = &self.sdk else { return false };
        sdk.open_port(&port_name(address)).await
    }

    async fn disconnect(&self, address: &str) {
        if let Some(sdk) = &self.sdk {
            sdk.close_port(&port_name(address)).await;
        }
    }

    async fn probe(&self, address: &str) -> ProbeStatus {
        let Some(sdk) = &self.sdk else {
            return ProbeStatus::Unresponsive;
        };
        match sdk.status(&port_name(address)).await {
            Some(status) => status.to_probe(),
            None => ProbeStatus::Unresponsive,
        }
    }

    async fn send(&self, address: &str, bytes: &[u8]) -> bool {
        let Some(sdk) = &self.sdk else { return false };
        if bytes.is_empty() {
            return false;
        }
        sdk.write(&port_name(address), bytes).await
    }

    async fn discover(&self) -> BTreeSet<String> {
        let Some(sdk) = &self.sdk else {
            return BTreeSet::new();
        };
        sdk.search_bluetooth()
            .await
            .into_iter()
            .map(|mac| mac.trim().to_uppercase())
            .filter(|mac| !mac.is_empty())
            .collect()
    }

    /// Vendor ports take plain text; tags are flattened rather than sent raw.
    fn compile(&self, markup: &str, paper: PaperWidth) -> Vec<u8> {
        if self.sdk.is_none() {
            return Vec::new();
        }
        to_plain_text(markup, paper.chars()).into_bytes()
    }
}

/// Driver used when nothing else applies.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDriver;

#[async_trait]
impl PrinterDriver for NullDriver {
    fn id(&self) -> &str {
        NULL_DRIVER_ID
    }

    fn is_available(&self) -> bool {
        false
    }

    async fn connect(&self, _address: &str) -> bool {
        false
    }

    async fn disconnect(&self, _address: &str) {}

    async fn probe(&self, _address: &str) -> ProbeStatus {
        ProbeStatus::Unresponsive
    }

    async fn send(&self, _address: &str, _bytes: &[u8]) -> bool {
        false
    }

    async fn discover(&self) -> BTreeSet<String> {
        BTreeSet::new()
    }

    fn compile(&self, _markup: &str, _paper: PaperWidth) -> Vec<u8> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeSdk {
        available: bool,
        status: Option<VendorStatus>,
        opened: Mutex<Vec<String>>,
        written: Mutex<Vec<(String, Vec<u8>)>>,
    }

    #[async_trait]
    impl VendorSdk for FakeSdk {
        fn name(&self) -> &str {
            "fake"
        }
        fn is_available(&self) -> bool {
            self.available
        }
        async fn search_bluetooth(&self) -> Vec<String> {
            vec!["00:11:62:aa:bb:cc".into(), " ".into()]
        }
        async fn open_port(&self, port_name: &str) -> bool {
            self.opened.lock().unwrap().push(port_name.to_string());
            true
        }
        async fn close_port(&self, _port_name: &str) {}
        async fn write(&self, port_name: &str, data: &[u8]) -> bool {
            self.written
                .lock()
                .unwrap()
                .push((port_name.to_string(), data.to_vec()));
            true
        }
        async fn status(&self, _port_name: &str) -> Option<VendorStatus> {
            self.status
        }
    }

    #[test]
    fn test_port_names() {
        assert_eq!(port_name("00:11:62:aa:bb:cc"), "BT:00:11:62:AA:BB:CC");
        assert_eq!(port_name("10.0.0.5:9100"), "TCP:10.0.0.5:9100");
    }

    #[tokio::test]
    async fn test_missing_sdk_fails_deterministically() {
        let driver = VendorDriver::resolve("star", None);
        assert!(!driver.is_available());
        assert!(!driver.connect("00:11:62:AA:BB:CC").await);
        assert!(!driver.send("00:11:62:AA:BB:CC", b"x").await);
        assert_eq!(driver.probe("x").await, ProbeStatus::Unresponsive);
        assert!(driver.discover().await.is_empty());
        assert!(driver.compile("[L]hi", PaperWidth::Mm58).is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_sdk_is_never_used() {
        let sdk = Arc::new(FakeSdk::default());
        let driver = VendorDriver::resolve("star", Some(sdk.clone()));
        assert!(!driver.connect("00:11:62:AA:BB:CC").await);
        assert!(sdk.opened.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_available_sdk_round_trip() {
        let sdk = Arc::new(FakeSdk {
            available: true,
            status: Some(VendorStatus {
                paper_empty: true,
                ..Default::default()
            }),
            ..Default::default()
        });
        let driver = VendorDriver::resolve("star", Some(sdk.clone()));
        let mac = "00:11:62:aa:bb:cc";

        assert!(driver.connect(mac).await);
        assert_eq!(sdk.opened.lock().unwrap()[0], "BT:00:11:62:AA:BB:CC");

        let bytes = driver.compile("[C]<b>Shop</b>\n[CUT]\n", PaperWidth::Mm58);
        assert_eq!(String::from_utf8(bytes.clone()).unwrap(), format!("{}Shop\n", " ".repeat(14)));
        assert!(driver.send(mac, &bytes).await);
        assert_eq!(sdk.written.lock().unwrap().len(), 1);

        assert_eq!(
            driver.probe(mac).await,
            ProbeStatus::Degraded(DeviceSignal::PaperOut)
        );
        let found = driver.discover().await;
        assert_eq!(found.into_iter().collect::<Vec<_>>(), vec!["00:11:62:AA:BB:CC"]);
    }

    #[test]
    fn test_vendor_status_priority() {
        let offline = VendorStatus {
            offline: true,
            paper_empty: true,
            ..Default::default()
        };
        assert_eq!(offline.to_probe(), ProbeStatus::Unresponsive);
        let battery = VendorStatus {
            battery_low: true,
            ..Default::default()
        };
        assert_eq!(battery.to_probe(), ProbeStatus::Degraded(DeviceSignal::LowBattery));
    }
}
