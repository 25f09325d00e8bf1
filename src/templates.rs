//! Print template configurations.
//!
//! A template is a set of section switches plus a footer line. Templates are
//! versioned by `template_id`; the renderer always receives a copy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::SectionToggles;

pub const DEFAULT_FOOTER: &str = "Thank you for your order!";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateType {
    FullDetails,
    Delivery,
    Kitchen,
}

impl TemplateType {
    pub fn id(self) -> &'static str {
        match self {
            TemplateType::FullDetails => "full_details",
            TemplateType::Delivery => "delivery",
            TemplateType::Kitchen => "kitchen",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateConfig {
    pub template_id: String,
    pub template_type: TemplateType,
    #[serde(default)]
    pub template_name: String,

    #[serde(default = "yes")]
    pub show_store_info: bool,
    #[serde(default = "yes")]
    pub show_store_name: bool,
    #[serde(default = "yes")]
    pub show_store_address: bool,
    #[serde(default = "yes")]
    pub show_store_phone: bool,

    /// Order number and date always print; the three order switches are
    /// kept so existing template files still load.
    #[serde(default = "yes")]
    pub show_order_info: bool,
    #[serde(default = "yes")]
    pub show_order_number: bool,
    #[serde(default = "yes")]
    pub show_order_date: bool,

    #[serde(default = "yes")]
    pub show_customer_info: bool,
    #[serde(default = "yes")]
    pub show_customer_name: bool,
    #[serde(default = "yes")]
    pub show_customer_phone: bool,
    #[serde(default)]
    pub show_delivery_info: bool,

    #[serde(default = "yes")]
    pub show_order_content: bool,
    #[serde(default = "yes")]
    pub show_item_details: bool,
    #[serde(default = "yes")]
    pub show_item_prices: bool,
    #[serde(default = "yes")]
    pub show_order_notes: bool,
    #[serde(default = "yes")]
    pub show_totals: bool,

    #[serde(default = "yes")]
    pub show_payment_info: bool,

    #[serde(default = "yes")]
    pub show_footer: bool,
    #[serde(default = "default_footer")]
    pub footer_text: String,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn yes() -> bool {
    true
}

fn default_footer() -> String {
    DEFAULT_FOOTER.to_string()
}

impl TemplateConfig {
    /// Preset configuration for a template type.
    pub fn preset(template_type: TemplateType) -> Self {
        let now = Utc::now();
        let full = Self {
            template_id: template_type.id().to_string(),
            template_type,
            template_name: "Full Order Details".into(),
            show_store_info: true,
            show_store_name: true,
            show_store_address: true,
            show_store_phone: true,
            show_order_info: true,
            show_order_number: true,
            show_order_date: true,
            show_customer_info: true,
            show_customer_name: true,
            show_customer_phone: true,
            show_delivery_info: false,
            show_order_content: true,
            show_item_details: true,
            show_item_prices: true,
            show_order_notes: true,
            show_totals: true,
            show_payment_info: true,
            show_footer: true,
            footer_text: default_footer(),
            created_at: now,
            updated_at: now,
        };

        match template_type {
            TemplateType::FullDetails => full,
            TemplateType::Delivery => Self {
                template_name: "Delivery Receipt".into(),
                show_delivery_info: true,
                ..full
            },
            TemplateType::Kitchen => Self {
                template_name: "Kitchen Order".into(),
                show_store_info: false,
                show_store_name: false,
                show_store_address: false,
                show_store_phone: false,
                show_customer_info: false,
                show_customer_name: false,
                show_customer_phone: false,
                show_item_prices: false,
                show_totals: false,
                show_payment_info: false,
                show_footer: false,
                ..full
            },
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.template_id.trim().is_empty() && !self.template_name.trim().is_empty()
    }

    /// Number of enabled top-level sections.
    pub fn enabled_section_count(&self) -> usize {
        [
            self.show_store_info,
            self.show_order_info,
            self.show_customer_info,
            self.show_order_content,
            self.show_payment_info,
            self.show_footer,
        ]
        .iter()
        .filter(|on| **on)
        .count()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Copy of this template with a printer profile's section switches
    /// applied on top. A section survives only if both allow it.
    pub fn restricted_by(&self, sections: &SectionToggles) -> Self {
        let mut t = self.clone();
        t.show_store_info &= sections.store_info;
        t.show_customer_info &= sections.customer_info;
        t.show_item_details &= sections.item_details;
        t.show_item_prices &= sections.item_prices;
        t.show_order_notes &= sections.order_notes;
        t.show_totals &= sections.totals;
        t.show_footer &= sections.footer;
        t
    }
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self::preset(TemplateType::FullDetails)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        let full = TemplateConfig::preset(TemplateType::FullDetails);
        assert_eq!(full.template_id, "full_details");
        assert!(!full.show_delivery_info);
        assert_eq!(full.enabled_section_count(), 6);

        let delivery = TemplateConfig::preset(TemplateType::Delivery);
        assert!(delivery.show_delivery_info);
        assert_eq!(delivery.template_name, "Delivery Receipt");

        let kitchen = TemplateConfig::preset(TemplateType::Kitchen);
        assert!(!kitchen.show_store_info);
        assert!(!kitchen.show_item_prices);
        assert!(!kitchen.show_payment_info);
        assert!(kitchen.show_order_notes);
        assert!(kitchen.show_item_details);
        assert_eq!(kitchen.enabled_section_count(), 2);
    }

    #[test]
    fn test_validity() {
        let mut t = TemplateConfig::default();
        assert!(t.is_valid());
        t.template_id = "  ".into();
        assert!(!t.is_valid());
    }

    #[test]
    fn test_profile_sections_restrict_but_never_enable() {
        let kitchen = TemplateConfig::preset(TemplateType::Kitchen);
        let restricted = kitchen.restricted_by(&SectionToggles::default());
        assert_eq!(restricted, kitchen);

        let full = TemplateConfig::default();
        let no_customer = full.restricted_by(&SectionToggles {
            customer_info: false,
            ..SectionToggles::default()
        });
        assert!(!no_customer.show_customer_info);
        assert!(no_customer.show_store_info);
        assert!(full.show_customer_info);
    }

    #[test]
    fn test_missing_fields_default_on() {
        let t: TemplateConfig =
            serde_json::from_str(r#"{"templateId":"t1","templateType":"delivery"}"#).unwrap();
        assert!(t.show_totals);
        assert!(!t.show_delivery_info);
        assert_eq!(t.footer_text, DEFAULT_FOOTER);
    }
}
