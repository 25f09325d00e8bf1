//! Domain records shared by the sync coordinator, the renderer and the
//! printer registry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::metadata::OrderExtensions;

/// Remote status that marks an order as actionable for the kitchen/counter.
pub const STATUS_PROCESSING: &str = "processing";

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

/// Opaque key/value metadata entry attached to a remote order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetaEntry {
    pub key: String,
    pub value: String,
}

/// Named fee line (delivery fee, tip, surcharge...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeeLine {
    pub name: String,
    pub total: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemOption {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    pub product_id: i64,
    pub name: String,
    pub quantity: u32,
    pub unit_price: f64,
    pub line_total: f64,
    #[serde(default)]
    pub options: Vec<ItemOption>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Totals {
    pub subtotal: f64,
    pub tax: f64,
    pub fee: f64,
    pub discount: f64,
    pub total: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomerInfo {
    pub name: String,
    pub contact: String,
    pub billing: String,
}

impl CustomerInfo {
    pub fn is_empty(&self) -> bool {
        self.name.trim().is_empty()
            && self.contact.trim().is_empty()
            && self.billing.trim().is_empty()
    }
}

/// A remote order as seen by this terminal.
///
/// `printed`, `read` and `notified` are local flags. They are only advanced
/// by explicit mark operations on the repository; a re-fetched copy of the
/// same order never resets them (see [`OrderRecord::carry_flags_from`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRecord {
    pub id: i64,
    pub number: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub customer: CustomerInfo,
    #[serde(default)]
    pub items: Vec<LineItem>,
    #[serde(default)]
    pub totals: Totals,
    #[serde(default)]
    pub payment_method: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub printed: bool,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub notified: bool,
    #[serde(default)]
    pub extensions: OrderExtensions,
}

impl OrderRecord {
    pub fn new(id: i64, number: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            id,
            number: number.into(),
            status: status.into(),
            created_at: Utc::now(),
            customer: CustomerInfo::default(),
            items: Vec::new(),
            totals: Totals::default(),
            payment_method: String::new(),
            notes: String::new(),
            printed: false,
            read: false,
            notified: false,
            extensions: OrderExtensions::default(),
        }
    }

    pub fn is_processing(&self) -> bool {
        self.status.trim().eq_ignore_ascii_case(STATUS_PROCESSING)
    }

    /// Copy the local flags of a previously stored copy onto a fresh fetch.
    pub fn carry_flags_from(&mut self, stored: &OrderRecord) {
        self.printed |= stored.printed;
        self.read |= stored.read;
        self.notified |= stored.notified;
    }

    /// Whether the remote content differs from the stored copy, ignoring
    /// local flags.
    pub fn differs_remotely(&self, stored: &OrderRecord) -> bool {
        let mut a = self.clone();
        a.carry_flags_from(stored);
        let mut b = stored.clone();
        b.carry_flags_from(self);
        a != b
    }

    pub fn classify(&self) -> OrderClass {
        match (self.is_processing(), self.read) {
            (true, false) => OrderClass::New,
            (true, true) => OrderClass::InProcessing,
            _ => OrderClass::Other,
        }
    }
}

/// Terminal-side classification of a fetched order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderClass {
    New,
    InProcessing,
    Other,
}

// ---------------------------------------------------------------------------
// Printer profiles
// ---------------------------------------------------------------------------

/// How a printer is reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportKind {
    /// Paired SPP printer: a MAC address or a serial device path
    /// (`/dev/rfcomm0`, `COM5`).
    Bluetooth { address: String },
    /// Raw TCP printer, usually port 9100.
    Network { host: String, port: u16 },
}

impl TransportKind {
    pub fn address(&self) -> String {
        match self {
            TransportKind::Bluetooth { address } => address.clone(),
            TransportKind::Network { host, port } => format!("{host}:{port}"),
        }
    }
}

/// Per-printer section switches. A section prints only when both the
/// template and the profile allow it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SectionToggles {
    pub store_info: bool,
    pub customer_info: bool,
    pub item_details: bool,
    pub item_prices: bool,
    pub order_notes: bool,
    pub totals: bool,
    pub footer: bool,
}

impl Default for SectionToggles {
    fn default() -> Self {
        Self {
            store_info: true,
            customer_info: true,
            item_details: true,
            item_prices: true,
            order_notes: true,
            totals: true,
            footer: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrinterProfile {
    pub id: String,
    pub name: String,
    pub transport: TransportKind,
    #[serde(default = "default_paper_width")]
    pub paper_width_mm: u32,
    #[serde(default)]
    pub sections: SectionToggles,
    #[serde(default)]
    pub is_default: bool,
    /// Probe this printer in the background even when it is not the default.
    #[serde(default)]
    pub keep_alive: bool,
    /// Driver id in the driver registry; `None` selects the ESC/POS driver.
    #[serde(default)]
    pub driver: Option<String>,
    #[serde(default)]
    pub template_id: Option<String>,
}

fn default_paper_width() -> u32 {
    80
}

impl PrinterProfile {
    pub fn new(name: impl Into<String>, transport: TransportKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            transport,
            paper_width_mm: default_paper_width(),
            sections: SectionToggles::default(),
            is_default: false,
            keep_alive: false,
            driver: None,
            template_id: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Store display fields
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    pub name: String,
    pub address: String,
    pub phone: String,
    pub currency_symbol: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            name: "My Store".into(),
            address: String::new(),
            phone: String::new(),
            currency_symbol: "$".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let mut order = OrderRecord::new(100, "100", "processing");
        assert_eq!(order.classify(), OrderClass::New);
        order.read = true;
        assert_eq!(order.classify(), OrderClass::InProcessing);
        order.status = "completed".into();
        assert_eq!(order.classify(), OrderClass::Other);
    }

    #[test]
    fn test_refetch_keeps_local_flags() {
        let mut stored = OrderRecord::new(7, "7", "processing");
        stored.printed = true;
        stored.notified = true;

        let mut fetched = stored.clone();
        fetched.printed = false;
        fetched.notified = false;
        assert!(!fetched.differs_remotely(&stored));

        fetched.carry_flags_from(&stored);
        assert!(fetched.printed);
        assert!(fetched.notified);
        assert!(!fetched.read);
    }

    #[test]
    fn test_status_change_is_remote_difference() {
        let stored = OrderRecord::new(7, "7", "processing");
        let mut fetched = stored.clone();
        fetched.status = "completed".into();
        assert!(fetched.differs_remotely(&stored));
    }

    #[test]
    fn test_profile_transport_serde_shape() {
        let json = r#"{"id":"p1","name":"Kitchen","transport":{"kind":"network","host":"10.0.0.9","port":9100}}"#;
        let profile: PrinterProfile = serde_json::from_str(json).unwrap();
        assert_eq!(profile.transport.address(), "10.0.0.9:9100");
        assert_eq!(profile.paper_width_mm, 80);
        assert!(profile.sections.totals);
        assert!(!profile.is_default);
    }
}
