//! Remote order source.
//!
//! [`OrderSource`] is the contract the sync coordinator consumes.
//! [`HttpOrderSource`] implements it against a WooCommerce-compatible REST
//! API (`/wp-json/wc/v3/orders`) with HTTP Basic credentials.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::SourceError;
use crate::metadata::{extract_extensions, ExtractionInput};
use crate::models::{CustomerInfo, FeeLine, ItemOption, LineItem, MetaEntry, OrderRecord, Totals};
use crate::settings::SettingsStore;

/// Default timeout for API requests (30 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const ORDERS_PATH: &str = "/wp-json/wc/v3/orders";
const RETRY_COUNT_HEADER: &str = "X-Retry-Count";
/// Safety stop for runaway pagination.
const MAX_PAGES: u32 = 20;

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// Filter for a fetch. `None` fields are not sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderQuery {
    pub status: Option<String>,
    pub since: Option<DateTime<Utc>>,
}

/// Per-call metadata threaded through the retry wrapper.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallContext {
    pub retry_count: u32,
}

#[async_trait]
pub trait OrderSource: Send + Sync {
    async fn fetch_orders(
        &self,
        query: &OrderQuery,
        ctx: CallContext,
    ) -> Result<Vec<OrderRecord>, SourceError>;

    async fn update_order_status(
        &self,
        id: i64,
        status: &str,
        ctx: CallContext,
    ) -> Result<OrderRecord, SourceError>;
}

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the store URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes and a trailing `/wp-json`
pub fn normalize_site_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }
    if url.ends_with("/wp-json") {
        url.truncate(url.len() - "/wp-json".len());
    }
    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Map transport-level failure text to a [`SourceError`] kind.
pub fn source_error_from_message(url: &str, message: &str) -> SourceError {
    let lower = message.to_lowercase();
    if lower.contains("timed out") || lower.contains("timeout") {
        SourceError::Timeout(url.to_string())
    } else if lower.contains("connection reset")
        || lower.contains("broken pipe")
        || lower.contains("connection aborted")
    {
        SourceError::ConnectionReset(url.to_string())
    } else if lower.contains("dns")
        || lower.contains("failed to lookup")
        || lower.contains("name or service not known")
        || lower.contains("no such host")
    {
        SourceError::Dns(url.to_string())
    } else if lower.contains("handshake") || lower.contains("tls") || lower.contains("certificate") {
        SourceError::Handshake(message.to_string())
    } else if lower.contains("unreachable")
        || lower.contains("connection refused")
        || lower.contains("no route to host")
    {
        SourceError::Unreachable(url.to_string())
    } else {
        SourceError::Other(format!("Network error communicating with {url}: {message}"))
    }
}

fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut parts = vec![err.to_string()];
    let mut source = err.source();
    while let Some(inner) = source {
        parts.push(inner.to_string());
        source = inner.source();
    }
    parts.join(": ")
}

fn map_reqwest_error(url: &str, err: &reqwest::Error) -> SourceError {
    if err.is_timeout() {
        return SourceError::Timeout(url.to_string());
    }
    if err.is_decode() {
        return SourceError::Decode(err.to_string());
    }
    let mapped = source_error_from_message(url, &error_chain(err));
    match mapped {
        SourceError::Other(_) if err.is_connect() => SourceError::Unreachable(url.to_string()),
        other => other,
    }
}

/// Convert an HTTP status code into a user-friendly message.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "Consumer key or secret is invalid".to_string(),
        403 => "API user lacks permission for orders".to_string(),
        404 => "Order endpoint not found (is the REST API enabled?)".to_string(),
        429 => "Store is rate limiting requests".to_string(),
        s if s >= 500 => format!("Store server error (HTTP {s})"),
        s => format!("Unexpected response from store (HTTP {s})"),
    }
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

fn de_amount<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    Ok(value_to_amount(&Value::deserialize(d)?))
}

fn value_to_amount(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AddressDto {
    first_name: String,
    last_name: String,
    phone: String,
    email: String,
    address_1: String,
    city: String,
    state: String,
    postcode: String,
}

impl AddressDto {
    fn full_name(&self) -> String {
        format!("{} {}", self.first_name.trim(), self.last_name.trim())
            .trim()
            .to_string()
    }

    fn one_line(&self) -> String {
        [&self.address_1, &self.city, &self.state, &self.postcode]
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MetaDto {
    key: String,
    value: Value,
    display_key: Option<String>,
    display_value: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LineItemDto {
    product_id: i64,
    name: String,
    quantity: u32,
    #[serde(deserialize_with = "de_amount")]
    price: f64,
    #[serde(deserialize_with = "de_amount")]
    total: f64,
    meta_data: Vec<MetaDto>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FeeLineDto {
    name: String,
    total: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct OrderDto {
    id: i64,
    number: String,
    status: String,
    date_created: Option<String>,
    date_created_gmt: Option<String>,
    billing: AddressDto,
    shipping: AddressDto,
    line_items: Vec<LineItemDto>,
    #[serde(deserialize_with = "de_amount")]
    total: f64,
    #[serde(deserialize_with = "de_amount")]
    total_tax: f64,
    #[serde(deserialize_with = "de_amount")]
    discount_total: f64,
    #[serde(deserialize_with = "de_amount")]
    shipping_total: f64,
    fee_lines: Vec<FeeLineDto>,
    customer_note: String,
    payment_method_title: String,
    meta_data: Vec<MetaDto>,
}

fn parse_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

impl OrderDto {
    fn into_record(self) -> OrderRecord {
        let created_at = parse_timestamp(self.date_created_gmt.as_deref())
            .or_else(|| parse_timestamp(self.date_created.as_deref()))
            .unwrap_or_default();

        let customer = CustomerInfo {
            name: Some(self.billing.full_name())
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| "Guest".to_string()),
            contact: if self.billing.phone.trim().is_empty() {
                self.billing.email.trim().to_string()
            } else {
                self.billing.phone.trim().to_string()
            },
            billing: self.billing.one_line(),
        };

        let items: Vec<LineItem> = self
            .line_items
            .into_iter()
            .map(|item| LineItem {
                product_id: item.product_id,
                name: item.name,
                quantity: item.quantity,
                unit_price: item.price,
                line_total: item.total,
                options: item
                    .meta_data
                    .into_iter()
                    .filter(|m| !m.key.starts_with('_'))
                    .map(|m| ItemOption {
                        name: m.display_key.unwrap_or(m.key),
                        value: value_to_text(m.display_value.as_ref().unwrap_or(&m.value)),
                    })
                    .collect(),
            })
            .collect();

        let fee_lines: Vec<FeeLine> = self
            .fee_lines
            .iter()
            .map(|f| FeeLine {
                name: f.name.clone(),
                total: value_to_text(&f.total),
            })
            .collect();
        let meta: Vec<MetaEntry> = self
            .meta_data
            .iter()
            .map(|m| MetaEntry {
                key: m.key.clone(),
                value: value_to_text(&m.value),
            })
            .collect();

        let totals = Totals {
            subtotal: items.iter().map(|i| i.line_total).sum(),
            tax: self.total_tax,
            fee: self.fee_lines.iter().map(|f| value_to_amount(&f.total)).sum::<f64>()
                + self.shipping_total,
            discount: self.discount_total,
            total: self.total,
        };

        let extensions = extract_extensions(ExtractionInput {
            meta: &meta,
            fee_lines: &fee_lines,
            customer_note: &self.customer_note,
            billing_address: &customer.billing,
            shipping_address: &self.shipping.one_line(),
        });

        let number = if self.number.trim().is_empty() {
            self.id.to_string()
        } else {
            self.number
        };

        let mut record = OrderRecord::new(self.id, number, self.status);
        record.created_at = created_at;
        record.customer = customer;
        record.items = items;
        record.totals = totals;
        record.payment_method = self.payment_method_title;
        record.notes = self.customer_note;
        record.extensions = extensions;
        record
    }
}

/// Decode one order from the REST representation.
pub fn parse_order(value: Value) -> Result<OrderRecord, SourceError> {
    let dto: OrderDto =
        serde_json::from_value(value).map_err(|e| SourceError::Decode(e.to_string()))?;
    Ok(dto.into_record())
}

pub fn parse_order_list(value: Value) -> Result<Vec<OrderRecord>, SourceError> {
    let dtos: Vec<OrderDto> =
        serde_json::from_value(value).map_err(|e| SourceError::Decode(e.to_string()))?;
    Ok(dtos.into_iter().map(OrderDto::into_record).collect())
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

pub struct HttpOrderSource {
    client: Client,
    settings: Arc<SettingsStore>,
}

impl HttpOrderSource {
    pub fn new(settings: Arc<SettingsStore>) -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| SourceError::Other(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client, settings })
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
        ctx: CallContext,
    ) -> Result<Value, SourceError> {
        let source = self.settings.source();
        if !source.is_configured() {
            return Err(SourceError::Other("Order source credentials are not set".into()));
        }
        let base = normalize_site_url(&source.site_url);
        let url = format!("{base}{path}");
        let token = BASE64_STANDARD.encode(format!("{}:{}", source.consumer_key, source.consumer_secret));

        let mut req = self
            .client
            .request(method, &url)
            .header("Authorization", format!("Basic {token}"))
            .query(query);
        if ctx.retry_count > 0 {
            req = req.header(RETRY_COUNT_HEADER, ctx.retry_count.to_string());
        }
        if let Some(body) = body {
            req = req.json(&body);
        }

        let resp = req.send().await.map_err(|e| map_reqwest_error(&base, &e))?;
        let status = resp.status();
        let body_text = resp.text().await.map_err(|e| map_reqwest_error(&base, &e))?;

        if !status.is_success() {
            let detail = serde_json::from_str::<Value>(&body_text)
                .ok()
                .and_then(|json| json.get("message").and_then(Value::as_str).map(str::to_string));
            let message = match detail {
                Some(detail) => format!("{}: {detail}", status_error(status)),
                None => status_error(status),
            };
            warn!(url = %url, status = status.as_u16(), "order source request failed");
            return Err(SourceError::Http {
                status: status.as_u16(),
                message,
            });
        }

        if body_text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text)
            .map_err(|e| SourceError::Decode(format!("Invalid JSON from {base}: {e}")))
    }
}

#[async_trait]
impl OrderSource for HttpOrderSource {
    async fn fetch_orders(
        &self,
        query: &OrderQuery,
        ctx: CallContext,
    ) -> Result<Vec<OrderRecord>, SourceError> {
        let per_page = self.settings.sync().page_size.clamp(1, 100);
        let mut out = Vec::new();
        for page in 1..=MAX_PAGES {
            let mut params: Vec<(&str, String)> = vec![
                ("page", page.to_string()),
                ("per_page", per_page.to_string()),
            ];
            if let Some(status) = &query.status {
                params.push(("status", status.clone()));
            }
            if let Some(since) = query.since {
                params.push(("after", since.format("%Y-%m-%dT%H:%M:%S").to_string()));
            }
            let body = self.request(Method::GET, ORDERS_PATH, &params, None, ctx).await?;
            let batch = parse_order_list(body)?;
            let done = (batch.len() as u32) < per_page;
            out.extend(batch);
            if done {
                break;
            }
        }
        debug!(count = out.len(), "orders fetched");
        Ok(out)
    }

    async fn update_order_status(
        &self,
        id: i64,
        status: &str,
        ctx: CallContext,
    ) -> Result<OrderRecord, SourceError> {
        let path = format!("{ORDERS_PATH}/{id}");
        let body = serde_json::json!({ "status": status });
        let value = self.request(Method::PUT, &path, &[], Some(body), ctx).await?;
        parse_order(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_normalize_site_url() {
        assert_eq!(normalize_site_url("shop.example.com/"), "https://shop.example.com");
        assert_eq!(normalize_site_url("localhost:8080"), "http://localhost:8080");
        assert_eq!(
            normalize_site_url(" https://shop.example.com/wp-json/ "),
            "https://shop.example.com"
        );
    }

    #[test]
    fn test_transport_messages_are_classified() {
        let url = "https://shop";
        assert_eq!(
            source_error_from_message(url, "operation timed out"),
            SourceError::Timeout(url.into())
        );
        assert_eq!(
            source_error_from_message(url, "Connection reset by peer (os error 104)"),
            SourceError::ConnectionReset(url.into())
        );
        assert_eq!(
            source_error_from_message(url, "dns error: failed to lookup address information"),
            SourceError::Dns(url.into())
        );
        assert!(matches!(
            source_error_from_message(url, "invalid peer certificate: UnknownIssuer"),
            SourceError::Handshake(_)
        ));
        assert_eq!(
            source_error_from_message(url, "Network is unreachable (os error 101)"),
            SourceError::Unreachable(url.into())
        );
        assert!(matches!(
            source_error_from_message(url, "something odd"),
            SourceError::Other(_)
        ));
    }

    #[test]
    fn test_parse_order_maps_rest_fields() {
        let json = serde_json::json!({
            "id": 100,
            "number": "100",
            "status": "processing",
            "date_created": "2026-03-01T13:00:00",
            "date_created_gmt": "2026-03-01T12:00:00",
            "billing": {
                "first_name": "Ada",
                "last_name": "Lovelace",
                "phone": "",
                "email": "ada@example.com",
                "address_1": "12 Analytical Rd",
                "city": "London",
                "postcode": "N1"
            },
            "shipping": {},
            "line_items": [{
                "product_id": 7,
                "name": "Flat white",
                "quantity": 2,
                "price": 3.5,
                "total": "7.00",
                "meta_data": [
                    {"key": "_reduced_stock", "value": "2"},
                    {"key": "milk", "value": "oat", "display_key": "Milk", "display_value": "Oat"}
                ]
            }],
            "total": "11.00",
            "total_tax": "0.00",
            "discount_total": "0.00",
            "shipping_total": "0.00",
            "fee_lines": [{"name": "Delivery Fee", "total": "4.00"}],
            "customer_note": "Ring twice",
            "payment_method_title": "Cash on delivery",
            "meta_data": [{"key": "exwfood_order_method", "value": "delivery"}]
        });

        let order = parse_order(json).unwrap();
        assert_eq!(order.id, 100);
        assert_eq!(order.created_at, Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap());
        assert_eq!(order.customer.name, "Ada Lovelace");
        assert_eq!(order.customer.contact, "ada@example.com");
        assert_eq!(order.customer.billing, "12 Analytical Rd, London, N1");
        assert_eq!(order.items[0].unit_price, 3.5);
        assert_eq!(order.items[0].line_total, 7.0);
        assert_eq!(
            order.items[0].options,
            vec![ItemOption {
                name: "Milk".into(),
                value: "Oat".into()
            }]
        );
        assert_eq!(order.totals.fee, 4.0);
        assert_eq!(order.totals.total, 11.0);
        assert!(order.extensions.is_delivery);
        assert_eq!(order.extensions.delivery_fee.as_deref(), Some("4.00"));
        assert!(!order.printed);
    }

    #[test]
    fn test_parse_order_defaults() {
        let order = parse_order(serde_json::json!({"id": 5, "status": "pending"})).unwrap();
        assert_eq!(order.number, "5");
        assert_eq!(order.customer.name, "Guest");
        assert_eq!(order.created_at, DateTime::<Utc>::default());
        assert!(parse_order_list(serde_json::json!({"code": "oops"})).is_err());
    }
}
