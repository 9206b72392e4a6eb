//! Outbound message templates: a "main" pool for contacts with a complete
//! profile and an "alt" pool for everyone else, loaded from a two-column CSV
//! (`kind,template`).

use crate::db::ContactForDispatch;
use anyhow::{Context, Result};
use rand::Rng;
use std::path::Path;

#[derive(Debug, Clone, Default)]
pub struct TemplatePools {
    main: Vec<String>,
    alt: Vec<String>,
}

impl TemplatePools {
    pub fn new(main: Vec<String>, alt: Vec<String>) -> Self {
        Self { main, alt }
    }

    pub fn from_csv_path(path: impl AsRef<Path>) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(path.as_ref())
            .with_context(|| format!("failed to open template CSV {}", path.as_ref().display()))?;

        let mut pools = TemplatePools::default();
        for record in reader.records() {
            let record = record.context("malformed template CSV row")?;
            let (Some(kind), Some(template)) = (record.get(0), record.get(1)) else {
                continue;
            };
            let template = template.trim();
            if template.is_empty() {
                continue;
            }
            if kind.trim().eq_ignore_ascii_case("main") {
                pools.main.push(template.to_string());
            } else {
                pools.alt.push(template.to_string());
            }
        }
        Ok(pools)
    }

    pub fn is_empty(&self) -> bool {
        self.main.is_empty() && self.alt.is_empty()
    }

    /// Pick a template for a contact: the main pool when the personalization
    /// fields are present, else the alt pool, pseudorandomly for variety.
    /// Falls back to the other pool rather than returning nothing.
    pub fn choose(&self, contact: &ContactForDispatch) -> Option<&str> {
        let preferred = if has_complete_profile(contact) { &self.main } else { &self.alt };
        let pool = if preferred.is_empty() {
            if has_complete_profile(contact) { &self.alt } else { &self.main }
        } else {
            preferred
        };
        if pool.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..pool.len());
        Some(&pool[idx])
    }
}

pub fn has_complete_profile(contact: &ContactForDispatch) -> bool {
    let filled = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
    filled(&contact.first_name) && filled(&contact.property_address)
}

/// Substitute the named placeholders; absent fields render as empty strings.
pub fn render(template: &str, contact: &ContactForDispatch) -> String {
    template
        .replace("{firstName}", contact.first_name.as_deref().unwrap_or(""))
        .replace("{propertyAddress}", contact.property_address.as_deref().unwrap_or(""))
}
