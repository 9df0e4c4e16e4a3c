use kairos_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

/// Size class of a catalog model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelCategory {
    Small,
    Medium,
    Large,
}

impl fmt::Display for ModelCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModelCategory::Small => "small",
            ModelCategory::Medium => "medium",
            ModelCategory::Large => "large",
        };
        f.write_str(s)
    }
}

/// A downloadable model artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// On-disk filename; also the cache key
    pub name: String,
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    /// Source URL
    pub url: String,
    /// Expected size, shown before downloading
    pub size_bytes: Option<u64>,
    pub category: ModelCategory,
    #[serde(default)]
    pub min_ram: String,
    #[serde(default)]
    pub recommended: bool,
}

impl ModelDescriptor {
    /// Human readable size, e.g. `2.2 GB`
    pub fn size_text(&self) -> String {
        match self.size_bytes {
            Some(bytes) => format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0)),
            None => "unknown size".to_string(),
        }
    }
}

/// Catalog file contents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogData {
    pub version: String,
    pub models: Vec<ModelDescriptor>,
}

/// Read-only list of known models
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    models: Vec<ModelDescriptor>,
    index: HashMap<String, usize>,
}

impl ModelCatalog {
    /// Load catalog from JSON file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::load_from_json(&content)
    }

    /// Load catalog from JSON string
    pub fn load_from_json(json: &str) -> Result<Self> {
        let data: CatalogData = serde_json::from_str(json)?;
        Self::from_data(data)
    }

    /// Load the built-in catalog
    pub fn load_defaults() -> Result<Self> {
        let json = include_str!("default_catalog.json");
        Self::load_from_json(json)
    }

    /// Build a catalog, rejecting duplicate names and multiple recommendations
    pub fn from_data(data: CatalogData) -> Result<Self> {
        let mut index = HashMap::with_capacity(data.models.len());
        let mut recommended_found = false;

        for (i, model) in data.models.iter().enumerate() {
            if model.name.trim().is_empty() {
                return Err(Error::ConfigError("Catalog entry with empty name".into()));
            }
            if index.insert(model.name.clone(), i).is_some() {
                return Err(Error::ConfigError(format!(
                    "Duplicate catalog entry: {}",
                    model.name
                )));
            }
            if model.recommended {
                if recommended_found {
                    return Err(Error::ConfigError(
                        "Multiple recommended models specified".into(),
                    ));
                }
                recommended_found = true;
            }
        }

        Ok(Self {
            models: data.models,
            index,
        })
    }

    /// Get a model by name
    pub fn get(&self, name: &str) -> Result<&ModelDescriptor> {
        self.index
            .get(name)
            .map(|&i| &self.models[i])
            .ok_or_else(|| Error::ModelNotFound(name.to_string()))
    }

    /// All models in catalog order
    pub fn models(&self) -> &[ModelDescriptor] {
        &self.models
    }

    /// Models of one category, in catalog order
    pub fn by_category(&self, category: ModelCategory) -> Vec<&ModelDescriptor> {
        self.models
            .iter()
            .filter(|m| m.category == category)
            .collect()
    }

    /// The recommended model, if one is flagged
    pub fn recommended(&self) -> Option<&ModelDescriptor> {
        self.models.iter().find(|m| m.recommended)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
