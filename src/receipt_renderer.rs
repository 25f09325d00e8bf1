//! Order receipt rendering.
//!
//! `render_order` is pure: the same order, template and context always give
//! the same markup. Sections are emitted in a fixed order and each one is
//! owned by exactly one switch, so turning a switch off removes only that
//! section's lines.

use chrono::{DateTime, Utc};

use crate::error::RenderError;
use crate::escpos::PaperWidth;
use crate::markup::{Align, Markup, Span};
use crate::models::{OrderRecord, PrinterProfile, StoreSettings};
use crate::templates::{TemplateConfig, DEFAULT_FOOTER};

const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const TRAILING_FEED: u8 = 4;

/// Inputs that change slowly or per print, kept apart from the order.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderContext {
    pub store: StoreSettings,
    pub printed_at: DateTime<Utc>,
    pub paper: PaperWidth,
}

impl RenderContext {
    pub fn new(store: StoreSettings, paper: PaperWidth) -> Self {
        Self {
            store,
            printed_at: Utc::now(),
            paper,
        }
    }

    fn money(&self, value: f64) -> String {
        format!("{}{value:.2}", self.store.currency_symbol)
    }

    fn width(&self) -> usize {
        self.paper.chars()
    }
}

// ---------------------------------------------------------------------------
// Order receipt
// ---------------------------------------------------------------------------

pub fn render_order(
    order: &OrderRecord,
    template: &TemplateConfig,
    ctx: &RenderContext,
) -> Result<Markup, RenderError> {
    if !template.is_valid() {
        return Err(RenderError::InvalidTemplate(template.template_id.clone()));
    }
    if order.items.is_empty() {
        return Err(RenderError::EmptyOrder(order.number.clone()));
    }

    let mut doc = Markup::new();
    emit_header(&mut doc, template, ctx);
    if template.show_store_info {
        emit_store_info(&mut doc, template, ctx);
    }
    emit_order_info(&mut doc, order, ctx);
    if template.show_customer_info && !order.customer.is_empty() {
        emit_customer(&mut doc, order, template, ctx);
    }
    if template.show_delivery_info && order.extensions.is_delivery {
        emit_delivery(&mut doc, order, ctx);
    }
    emit_items(&mut doc, order, template, ctx);
    if template.show_totals {
        emit_totals(&mut doc, order, ctx);
    }
    if template.show_payment_info {
        emit_payment(&mut doc, order);
    }
    if template.show_order_notes && !order.notes.trim().is_empty() {
        doc.separator(ctx.width())
            .row(Align::Left, vec![Span::bold("Notes:")])
            .text(Align::Left, order.notes.trim());
    }
    if template.show_footer {
        emit_footer(&mut doc, template, ctx);
    }
    doc.feed(TRAILING_FEED).cut();
    Ok(doc)
}

/// Receipt that prints with any order and needs no template. Used when the
/// configured template cannot render.
pub fn render_minimal(order: &OrderRecord, ctx: &RenderContext) -> Markup {
    let mut doc = Markup::new();
    doc.row(Align::Center, vec![Span::bold(ctx.store.name.clone())])
        .separator(ctx.width())
        .labeled("Order #:", order.number.clone())
        .labeled("Date:", order.created_at.format(DATE_FORMAT).to_string())
        .separator(ctx.width());
    if order.items.is_empty() {
        doc.text(Align::Left, "(no items)");
    }
    for item in &order.items {
        doc.pair(
            vec![Span::plain(item.name.clone())],
            vec![Span::plain(item.quantity.to_string())],
        );
    }
    doc.separator(ctx.width())
        .pair(
            vec![Span::bold("Total:")],
            vec![Span::plain(ctx.money(order.totals.total))],
        )
        .feed(TRAILING_FEED)
        .cut();
    doc
}

fn emit_header(doc: &mut Markup, template: &TemplateConfig, ctx: &RenderContext) {
    let title = if template.show_store_name {
        ctx.store.name.clone()
    } else {
        template.template_name.clone()
    };
    doc.row(Align::Center, vec![Span::bold(title)]).blank();
}

fn emit_store_info(doc: &mut Markup, template: &TemplateConfig, ctx: &RenderContext) {
    let store = &ctx.store;
    if template.show_store_address && !store.address.trim().is_empty() {
        doc.text(Align::Center, store.address.trim());
    }
    if template.show_store_phone && !store.phone.trim().is_empty() {
        doc.text(Align::Center, format!("Tel: {}", store.phone.trim()));
    }
}

/// Always printed: staff match receipts to orders by these lines.
fn emit_order_info(doc: &mut Markup, order: &OrderRecord, ctx: &RenderContext) {
    doc.separator(ctx.width())
        .labeled("Order #:", order.number.clone())
        .labeled("Date:", order.created_at.format(DATE_FORMAT).to_string());
    doc.labeled("Printed:", ctx.printed_at.format(DATE_FORMAT).to_string());
}

fn emit_customer(
    doc: &mut Markup,
    order: &OrderRecord,
    template: &TemplateConfig,
    ctx: &RenderContext,
) {
    let customer = &order.customer;
    doc.separator(ctx.width())
        .row(Align::Left, vec![Span::bold("Customer")]);
    if template.show_customer_name && !customer.name.trim().is_empty() {
        doc.text(Align::Left, format!("Name: {}", customer.name.trim()));
    }
    if template.show_customer_phone && !customer.contact.trim().is_empty() {
        doc.text(Align::Left, format!("Contact: {}", customer.contact.trim()));
    }
    if !customer.billing.trim().is_empty() {
        doc.text(Align::Left, format!("Address: {}", customer.billing.trim()));
    }
}

fn emit_delivery(doc: &mut Markup, order: &OrderRecord, ctx: &RenderContext) {
    let ext = &order.extensions;
    doc.separator(ctx.width())
        .row(Align::Left, vec![Span::bold("Delivery")]);
    if !ext.delivery_method.is_empty() {
        doc.text(Align::Left, format!("Method: {}", ext.delivery_method));
    }
    if let Some(time) = &ext.delivery_time {
        doc.text(Align::Left, format!("Time: {time}"));
    }
    if let Some(address) = &ext.delivery_address {
        doc.text(Align::Left, format!("Address: {address}"));
    }
    if let Some(fee) = &ext.delivery_fee {
        doc.text(Align::Left, format!("Delivery fee: {}{fee}", ctx.store.currency_symbol));
    }
    if let Some(tip) = &ext.tip {
        doc.text(Align::Left, format!("Tip: {}{tip}", ctx.store.currency_symbol));
    }
}

fn emit_items(
    doc: &mut Markup,
    order: &OrderRecord,
    template: &TemplateConfig,
    ctx: &RenderContext,
) {
    let right_header = if template.show_item_prices {
        "Qty x Price"
    } else {
        "Qty"
    };
    doc.separator(ctx.width())
        .row(Align::Left, vec![Span::bold("Items")])
        .separator(ctx.width())
        .pair(vec![Span::bold("Item")], vec![Span::bold(right_header)]);

    for item in &order.items {
        let amount = if template.show_item_prices {
            format!("{} x {}", item.quantity, ctx.money(item.unit_price))
        } else {
            item.quantity.to_string()
        };
        doc.pair(vec![Span::plain(item.name.clone())], vec![Span::plain(amount)]);
        if template.show_item_details {
            for option in &item.options {
                doc.text(Align::Left, format!("  - {}: {}", option.name, option.value));
            }
        }
    }
}

fn emit_totals(doc: &mut Markup, order: &OrderRecord, ctx: &RenderContext) {
    let totals = &order.totals;
    doc.separator(ctx.width());
    let optional = [
        ("Subtotal:", totals.subtotal),
        ("Tax:", totals.tax),
        ("Fees:", totals.fee),
        ("Discount:", -totals.discount.abs()),
    ];
    for (label, amount) in optional {
        if amount.abs() >= 0.005 {
            doc.pair(vec![Span::plain(label)], vec![Span::plain(ctx.money(amount))]);
        }
    }
    doc.pair(
        vec![Span::bold("Total:")],
        vec![Span::bold(ctx.money(totals.total))],
    );
}

fn emit_payment(doc: &mut Markup, order: &OrderRecord) {
    let method = order.payment_method.trim();
    let method = if method.is_empty() { "-" } else { method };
    doc.pair(vec![Span::bold("Payment:")], vec![Span::plain(method)]);
}

fn emit_footer(doc: &mut Markup, template: &TemplateConfig, ctx: &RenderContext) {
    let text = template.footer_text.trim();
    let text = if text.is_empty() { DEFAULT_FOOTER } else { text };
    doc.separator(ctx.width()).text(Align::Center, text);
}

// ---------------------------------------------------------------------------
// Test page
// ---------------------------------------------------------------------------

pub fn render_test_page(profile: &PrinterProfile, ctx: &RenderContext) -> Markup {
    let mut doc = Markup::new();
    doc.row(Align::Center, vec![Span::bold(ctx.store.name.clone())])
        .row(Align::Center, vec![Span::bold("Printer test page")])
        .separator(ctx.width())
        .labeled("Printer:", profile.name.clone())
        .labeled("Address:", profile.transport.address())
        .labeled("Paper:", format!("{}mm", profile.paper_width_mm))
        .labeled("Time:", ctx.printed_at.format(DATE_FORMAT).to_string())
        .separator(ctx.width())
        .text(Align::Left, "Plain text")
        .row(Align::Left, vec![Span::bold("Bold text")])
        .separator(ctx.width())
        .text(Align::Left, "Left")
        .text(Align::Center, "Center")
        .text(Align::Right, "Right")
        .separator(ctx.width())
        .text(Align::Left, "0123456789")
        .pair(vec![Span::plain("Left column")], vec![Span::plain("Right column")])
        .separator(ctx.width())
        .text(Align::Center, "Test complete")
        .feed(3)
        .cut();
    doc
}
