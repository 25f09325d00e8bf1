//! Printer drivers.
//!
//! A driver turns markup into device bytes and performs the transport I/O for
//! every printer address it has been asked to connect to. Drivers never
//! panic or return errors across this boundary: failures come back as
//! `false`, an empty set, or [`ProbeStatus::Unresponsive`], and the registry
//! folds them into connection states.

pub mod escpos_driver;
pub mod tags;
pub mod vendor;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::escpos::PaperWidth;
use crate::models::PrinterProfile;

pub use escpos_driver::{EscPosDriver, EscPosOptions};
pub use vendor::{NullDriver, VendorDriver, VendorSdk, VendorStatus};

pub const ESCPOS_DRIVER_ID: &str = "escpos";
pub const NULL_DRIVER_ID: &str = "null";

/// Conditions a printer reports while still reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceSignal {
    PaperOut,
    Overheated,
    LowBattery,
}

/// Outcome of a lightweight liveness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStatus {
    Responsive,
    Degraded(DeviceSignal),
    Unresponsive,
}

impl ProbeStatus {
    pub fn is_reachable(self) -> bool {
        !matches!(self, ProbeStatus::Unresponsive)
    }
}

#[async_trait]
pub trait PrinterDriver: Send + Sync {
    fn id(&self) -> &str;

    /// Whether the driver can do anything at all on this host.
    fn is_available(&self) -> bool {
        true
    }

    /// Open a link to `address`. Already-open links count as success.
    async fn connect(&self, address: &str) -> bool;

    async fn disconnect(&self, address: &str);

    async fn probe(&self, address: &str) -> ProbeStatus;

    async fn send(&self, address: &str, bytes: &[u8]) -> bool;

    /// Addresses of printers this driver can currently see.
    async fn discover(&self) -> BTreeSet<String>;

    /// Translate markup into the bytes `send` expects.
    fn compile(&self, markup: &str, paper: PaperWidth) -> Vec<u8>;
}

// ---------------------------------------------------------------------------
// Brand detection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Brand {
    Star,
    Epson,
    Bixolon,
    Citizen,
    Zebra,
    Brother,
    Generic,
}

impl Brand {
    /// Driver id preferred for this brand, if a vendor driver exists.
    pub fn preferred_driver(self) -> Option<&'static str> {
        match self {
            Brand::Star => Some("star"),
            _ => None,
        }
    }
}

/// Checked in order; the first brand with a matching keyword wins, so the
/// generic entry must stay last.
const BRAND_KEYWORDS: &[(Brand, &[&str])] = &[
    (Brand::Star, &["star", "tsp", "sm-l", "sm-s", "mpop", "mc-print"]),
    (Brand::Epson, &["epson", "tm-"]),
    (Brand::Bixolon, &["bixolon", "srp-", "spp-r"]),
    (Brand::Citizen, &["citizen", "ct-s", "cmp-"]),
    (Brand::Zebra, &["zebra", "zq5", "zq3"]),
    (Brand::Brother, &["brother", "rj-", "pj-"]),
    (Brand::Generic, &["printer", "thermal", "receipt", "pos"]),
];

pub fn detect_brand(device_name: &str) -> Option<Brand> {
    let lower = device_name.to_lowercase();
    BRAND_KEYWORDS
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| lower.contains(k)))
        .map(|(brand, _)| *brand)
}

pub fn is_printer_like_name(device_name: &str) -> bool {
    detect_brand(device_name).is_some()
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Driver instances by id, resolved once at startup.
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn PrinterDriver>>,
    null: Arc<dyn PrinterDriver>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self {
            drivers: HashMap::new(),
            null: Arc::new(NullDriver),
        }
    }

    /// Registry with the ESC/POS driver and any vendor drivers supplied.
    pub fn with_defaults(options: EscPosOptions, vendors: Vec<VendorDriver>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(EscPosDriver::new(options)));
        for vendor in vendors {
            registry.register(Arc::new(vendor));
        }
        registry
    }

    pub fn register(&mut self, driver: Arc<dyn PrinterDriver>) {
        info!(
            driver = driver.id(),
            available = driver.is_available(),
            "printer driver registered"
        );
        self.drivers.insert(driver.id().to_string(), driver);
    }

    /// Driver by id; unknown ids get the null driver.
    pub fn get(&self, id: &str) -> Arc<dyn PrinterDriver> {
        self.drivers
            .get(id)
            .cloned()
            .unwrap_or_else(|| self.null.clone())
    }

    /// Driver for a profile: explicit id first, then the brand's vendor
    /// driver when one is registered and available, then ESC/POS.
    pub fn for_profile(&self, profile: &PrinterProfile) -> Arc<dyn PrinterDriver> {
        if let Some(id) = profile.driver.as_deref() {
            return self.get(id);
        }
        let vendor = detect_brand(&profile.name)
            .and_then(Brand::preferred_driver)
            .and_then(|id| self.drivers.get(id))
            .filter(|d| d.is_available())
            .cloned();
        if let Some(driver) = vendor {
            debug!(profile_id = %profile.id, driver = driver.id(), "vendor driver selected by brand");
            return driver;
        }
        self.get(ESCPOS_DRIVER_ID)
    }

    /// Union of every available driver's discovery results.
    pub async fn discover_all(&self) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        for driver in self.drivers.values().filter(|d| d.is_available()) {
            found.extend(driver.discover().await);
        }
        found
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TransportKind;

    #[test]
    fn test_brand_detection_order() {
        assert_eq!(detect_brand("Star TSP143IIIBI"), Some(Brand::Star));
        assert_eq!(detect_brand("EPSON TM-m30"), Some(Brand::Epson));
        assert_eq!(detect_brand("SRP-350plus"), Some(Brand::Bixolon));
        assert_eq!(detect_brand("Bluetooth Printer"), Some(Brand::Generic));
        assert_eq!(detect_brand("Pixel Buds"), None);
        assert!(is_printer_like_name("Thermal-58"));
    }

    #[test]
    fn test_unknown_driver_id_falls_back_to_null() {
        let registry = DriverRegistry::new();
        assert_eq!(registry.get("star").id(), NULL_DRIVER_ID);
    }

    #[test]
    fn test_profile_resolution() {
        let registry = DriverRegistry::with_defaults(
            EscPosOptions::default(),
            vec![VendorDriver::resolve("star", None)],
        );
        let mut profile = PrinterProfile::new(
            "Star mPOP",
            TransportKind::Bluetooth {
                address: "00:11:62:AA:BB:CC".into(),
            },
        );
        // vendor SDK missing: brand match falls through to ESC/POS
        assert_eq!(registry.for_profile(&profile).id(), ESCPOS_DRIVER_ID);

        profile.driver = Some("star".into());
        assert_eq!(registry.for_profile(&profile).id(), "star");

        profile.driver = Some("missing".into());
        assert_eq!(registry.for_profile(&profile).id(), NULL_DRIVER_ID);
    }
}
