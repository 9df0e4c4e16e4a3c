#[cfg(test)]
mod tests {
    use crate::catalog::*;
    use crate::config_loader::*;
    use kairos_common::{Error, Result};

    #[test]
    fn test_load_default_catalog() -> Result<()> {
        let catalog = ModelCatalog::load_defaults()?;

        assert_eq!(catalog.len(), 6);

        let recommended = catalog.recommended().expect("a recommended model");
        assert_eq!(recommended.name, "phi-3-mini-4k-instruct-q4.gguf");
        assert_eq!(recommended.category, ModelCategory::Small);

        Ok(())
    }

    #[test]
    fn test_catalog_partitions_by_category() -> Result<()> {
        let catalog = ModelCatalog::load_defaults()?;

        assert_eq!(catalog.by_category(ModelCategory::Small).len(), 3);
        assert_eq!(catalog.by_category(ModelCategory::Medium).len(), 1);
        assert_eq!(catalog.by_category(ModelCategory::Large).len(), 2);

        Ok(())
    }

    #[test]
    fn test_catalog_lookup() -> Result<()> {
        let catalog = ModelCatalog::load_defaults()?;

        let model = catalog.get("mistral-7b-instruct-v0.2.Q4_K_M.gguf")?;
        assert_eq!(model.display_name, "Mistral 7B Instruct v0.2");
        assert_eq!(model.size_bytes, Some(4721669018));
        assert_eq!(model.size_text(), "4.4 GB");

        assert!(matches!(catalog.get("missing.gguf"), Err(Error::ModelNotFound(_))));

        Ok(())
    }

    #[test]
    fn test_catalog_rejects_multiple_recommended() {
        let json = r#"{
            "version": "1.0",
            "models": [
                {"name": "a.gguf", "display_name": "A", "url": "http://x/a", "size_bytes": 1, "category": "small", "recommended": true},
                {"name": "b.gguf", "display_name": "B", "url": "http://x/b", "size_bytes": 2, "category": "large", "recommended": true}
            ]
        }"#;

        assert!(matches!(ModelCatalog::load_from_json(json), Err(Error::ConfigError(_))));
    }

    #[test]
    fn test_catalog_rejects_duplicate_names() {
        let json = r#"{
            "version": "1.0",
            "models": [
                {"name": "a.gguf", "display_name": "A", "url": "http://x/a", "size_bytes": null, "category": "small"},
                {"name": "a.gguf", "display_name": "A2", "url": "http://x/a2", "size_bytes": null, "category": "small"}
            ]
        }"#;

        assert!(matches!(ModelCatalog::load_from_json(json), Err(Error::ConfigError(_))));
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();

        assert!(config.paths.models_dir.ends_with("kairos/models"));
        assert_eq!(config.download.timeout_secs, 7200);
        assert_eq!(config.download.buffer_bytes, 1024 * 1024);
        assert!(config.filter.stop_markers.contains(&"User:".to_string()));
        assert!(config.filter.window.is_none());
        assert_eq!(config.runtime.context_size, 4096);
    }

    #[test]
    fn test_partial_config_uses_defaults() -> Result<()> {
        let json = r#"{ "runtime": { "port": 9090 } }"#;
        let config: AppConfig = serde_json::from_str(json)?;

        assert_eq!(config.runtime.port, 9090);
        assert_eq!(config.runtime.context_size, 4096);
        assert_eq!(config.generation.max_tokens, 2048);

        Ok(())
    }

    #[test]
    fn test_save_and_load_config() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested/config.json");

        let mut config = AppConfig::default();
        config.paths = PathsConfig::rooted_at(dir.path());
        config.filter.window = Some(32);

        ConfigLoader::save(&config, &path)?;
        let loaded = ConfigLoader::load(Some(&path))?;

        assert_eq!(loaded.paths.models_dir, dir.path().join("models"));
        assert_eq!(loaded.filter.window, Some(32));

        Ok(())
    }

    #[test]
    fn test_missing_explicit_config_is_an_error() {
        let path = std::path::PathBuf::from("/definitely/not/here/kairos.json");
        assert!(matches!(ConfigLoader::load(Some(&path)), Err(Error::ConfigError(_))));
    }
}
