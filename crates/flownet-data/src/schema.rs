//! Serde data file structs for recipe, chain and conversion-rate definitions.
//!
//! Amounts are `f64` on disk and converted to fixed point when the loader
//! resolves them into engine types. The engine configuration file
//! deserializes straight into [`flownet_core::config::EngineConfig`].

use serde::Deserialize;

// ===========================================================================
// Recipes
// ===========================================================================

/// A recipe input or output entry, in short tuple form or full form.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AmountData {
    /// Short form: `("ore", 10.0)`.
    Short(String, f64),
    /// Full form: `{ resource: "ore", amount: 10.0 }`.
    Full { resource: String, amount: f64 },
}

impl AmountData {
    pub fn resource(&self) -> &str {
        match self {
            AmountData::Short(resource, _) | AmountData::Full { resource, .. } => resource,
        }
    }

    pub fn amount(&self) -> f64 {
        match self {
            AmountData::Short(_, amount) | AmountData::Full { amount, .. } => *amount,
        }
    }
}

/// A recipe definition in a data file.
#[derive(Debug, Clone, Deserialize)]
pub struct RecipeData {
    pub name: String,
    #[serde(default)]
    pub inputs: Vec<AmountData>,
    pub outputs: Vec<AmountData>,
    /// Ticks at efficiency 1.
    pub duration: u64,
    #[serde(default)]
    pub base_efficiency: Option<f64>,
    #[serde(default)]
    pub technology: Option<String>,
}

// ===========================================================================
// Chains
// ===========================================================================

/// A chain definition: recipe names in execution order.
#[derive(Debug, Clone, Deserialize)]
pub struct ChainData {
    pub name: String,
    pub steps: Vec<String>,
}

// ===========================================================================
// Conversion rates
// ===========================================================================

/// One unit of `source` converts into `rate` units of `target`.
#[derive(Debug, Clone, Deserialize)]
pub struct ConversionRateData {
    pub source: String,
    pub target: String,
    pub rate: f64,
}
