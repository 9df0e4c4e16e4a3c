mod catalog;
mod config_loader;

#[cfg(test)]
mod tests;

pub use catalog::{CatalogData, ModelCatalog, ModelCategory, ModelDescriptor};
pub use config_loader::{
    AppConfig, ConfigLoader, DownloadConfig, FilterConfig, PathsConfig, RuntimeConfig,
};
