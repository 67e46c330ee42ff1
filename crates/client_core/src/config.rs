use std::{collections::HashMap, fs};

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub base_url: String,
    /// Explicit hub endpoint; derived from `base_url` when unset.
    pub hub_url: Option<String>,
    pub database_url: String,
    pub page_size: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5050".into(),
            hub_url: None,
            database_url: "sqlite://./data/client.db".into(),
            page_size: 50,
        }
    }
}

impl Settings {
    pub fn hub_url(&self) -> String {
        self.hub_url.clone().unwrap_or_else(|| {
            format!("{}/chatHub", self.base_url.trim_end_matches('/'))
        })
    }
}

/// Layering: defaults, then `client.toml`, then `APP__*` environment
/// variables.
pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("client.toml") {
        apply_file_values(&mut settings, &raw);
    }

    if let Ok(v) = std::env::var("APP__BASE_URL") {
        settings.base_url = v;
    }
    if let Ok(v) = std::env::var("APP__HUB_URL") {
        settings.hub_url = Some(v);
    }
    if let Ok(v) = std::env::var("APP__DATABASE_URL") {
        settings.database_url = v;
    }
    if let Ok(v) = std::env::var("APP__PAGE_SIZE") {
        if let Ok(parsed) = v.parse::<u32>() {
            settings.page_size = parsed;
        }
    }

    settings
}

fn apply_file_values(settings: &mut Settings, raw: &str) {
    let Ok(file_cfg) = toml::from_str::<HashMap<String, toml::Value>>(raw) else {
        return;
    };
    if let Some(v) = file_cfg.get("base_url").and_then(|v| v.as_str()) {
        settings.base_url = v.to_string();
    }
    if let Some(v) = file_cfg.get("hub_url").and_then(|v| v.as_str()) {
        settings.hub_url = Some(v.to_string());
    }
    if let Some(v) = file_cfg.get("database_url").and_then(|v| v.as_str()) {
        settings.database_url = v.to_string();
    }
    if let Some(v) = file_cfg.get("page_size").and_then(|v| v.as_integer()) {
        if let Ok(parsed) = u32::try_from(v) {
            settings.page_size = parsed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hub_url_derives_from_base_url_when_unset() {
        let settings = Settings {
            base_url: "http://example.com:5050/".into(),
            ..Settings::default()
        };
        assert_eq!(settings.hub_url(), "http://example.com:5050/chatHub");
    }

    #[test]
    fn file_values_override_defaults() {
        let mut settings = Settings::default();
        apply_file_values(
            &mut settings,
            r#"
                base_url = "http://staging.example.com"
                page_size = 20
            "#,
        );
        assert_eq!(settings.base_url, "http://staging.example.com");
        assert_eq!(settings.page_size, 20);
        assert_eq!(settings.hub_url(), "http://staging.example.com/chatHub");
    }

    #[test]
    fn malformed_file_is_ignored() {
        let mut settings = Settings::default();
        apply_file_values(&mut settings, "not [valid toml");
        assert_eq!(settings.base_url, Settings::default().base_url);
    }
}
