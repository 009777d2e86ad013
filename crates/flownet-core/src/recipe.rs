//! Conversion recipes and their registry.
//!
//! Recipes are immutable once registered. The registry hands out
//! `Arc<ConversionRecipe>` so running processes keep the exact definition
//! they were started with.

use crate::fixed::{Fixed64, Ticks};
use crate::id::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Errors raised while registering or resolving recipes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecipeError {
    #[error("recipe id is missing")]
    MissingId,
    #[error("recipe {0} is already registered")]
    Duplicate(RecipeId),
    #[error("recipe {0} declares no outputs")]
    EmptyOutputs(RecipeId),
    #[error("recipe {recipe}: amount of {resource} must be positive")]
    NonPositiveAmount {
        recipe: RecipeId,
        resource: ResourceType,
    },
    #[error("recipe {0} must have a non-zero duration")]
    ZeroDuration(RecipeId),
    #[error("recipe {0} must have a positive base efficiency")]
    NonPositiveEfficiency(RecipeId),
}

/// One input or output line of a recipe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipeEntry {
    pub resource: ResourceType,
    pub amount: Fixed64,
}

impl RecipeEntry {
    pub fn new(resource: impl Into<ResourceType>, amount: Fixed64) -> Self {
        Self {
            resource: resource.into(),
            amount,
        }
    }
}

/// An input-to-output transformation executed by converters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionRecipe {
    pub id: RecipeId,
    pub inputs: Vec<RecipeEntry>,
    pub outputs: Vec<RecipeEntry>,
    pub base_efficiency: Fixed64,
    /// Ticks needed to reach full progress at efficiency 1.
    pub duration: Ticks,
    pub required_technology: Option<TechId>,
}

impl ConversionRecipe {
    pub fn new(id: impl Into<RecipeId>, duration: Ticks) -> Self {
        Self {
            id: id.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            base_efficiency: Fixed64::ONE,
            duration,
            required_technology: None,
        }
    }

    pub fn input(mut self, resource: impl Into<ResourceType>, amount: Fixed64) -> Self {
        self.inputs.push(RecipeEntry::new(resource, amount));
        self
    }

    pub fn output(mut self, resource: impl Into<ResourceType>, amount: Fixed64) -> Self {
        self.outputs.push(RecipeEntry::new(resource, amount));
        self
    }

    pub fn with_base_efficiency(mut self, efficiency: Fixed64) -> Self {
        self.base_efficiency = efficiency;
        self
    }

    pub fn requiring(mut self, tech: impl Into<TechId>) -> Self {
        self.required_technology = Some(tech.into());
        self
    }

    /// Whether `resource` is consumed by this recipe.
    pub fn consumes(&self, resource: &ResourceType) -> bool {
        self.inputs.iter().any(|e| &e.resource == resource)
    }

    fn validate(&self) -> Result<(), RecipeError> {
        if self.id.is_blank() {
            return Err(RecipeError::MissingId);
        }
        if self.outputs.is_empty() {
            return Err(RecipeError::EmptyOutputs(self.id.clone()));
        }
        if let Some(entry) = self
            .inputs
            .iter()
            .chain(self.outputs.iter())
            .find(|e| e.amount <= Fixed64::ZERO)
        {
            return Err(RecipeError::NonPositiveAmount {
                recipe: self.id.clone(),
                resource: entry.resource.clone(),
            });
        }
        if self.duration == 0 {
            return Err(RecipeError::ZeroDuration(self.id.clone()));
        }
        if self.base_efficiency <= Fixed64::ZERO {
            return Err(RecipeError::NonPositiveEfficiency(self.id.clone()));
        }
        Ok(())
    }
}

/// The id `set_conversion_rate` gives its synthesized recipe.
pub fn conversion_rate_recipe_id(source: &ResourceType, target: &ResourceType) -> RecipeId {
    RecipeId::new(format!("convert:{source}->{target}"))
}

/// Registered recipes, kept in registration order.
#[derive(Debug, Default, Clone)]
pub struct RecipeRegistry {
    recipes: Vec<Arc<ConversionRecipe>>,
    index: HashMap<RecipeId, usize>,
}

impl RecipeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a recipe. Ids are unique; a rejected recipe leaves the
    /// registry unchanged.
    pub fn register(&mut self, recipe: ConversionRecipe) -> Result<Arc<ConversionRecipe>, RecipeError> {
        recipe.validate()?;
        if self.index.contains_key(&recipe.id) {
            return Err(RecipeError::Duplicate(recipe.id));
        }
        let recipe = Arc::new(recipe);
        self.index.insert(recipe.id.clone(), self.recipes.len());
        self.recipes.push(recipe.clone());
        Ok(recipe)
    }

    /// Register or replace the single-input, single-output recipe converting
    /// one unit of `source` into `rate` units of `target`.
    pub fn set_conversion_rate(
        &mut self,
        source: &ResourceType,
        target: &ResourceType,
        rate: Fixed64,
        duration: Ticks,
    ) -> Result<Arc<ConversionRecipe>, RecipeError> {
        let recipe = ConversionRecipe::new(conversion_rate_recipe_id(source, target), duration)
            .input(source.clone(), Fixed64::ONE)
            .output(target.clone(), rate);
        recipe.validate()?;

        let recipe = Arc::new(recipe);
        match self.index.get(&recipe.id) {
            // Running processes keep the old Arc.
            Some(&slot) => self.recipes[slot] = recipe.clone(),
            None => {
                self.index.insert(recipe.id.clone(), self.recipes.len());
                self.recipes.push(recipe.clone());
            }
        }
        Ok(recipe)
    }

    pub fn get(&self, id: &str) -> Option<&Arc<ConversionRecipe>> {
        self.index.get(id).map(|&i| &self.recipes[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Every recipe in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ConversionRecipe>> {
        self.recipes.iter()
    }

    pub fn len(&self) -> usize {
        self.recipes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recipes.is_empty()
    }
}
