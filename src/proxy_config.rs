pub const DEFAULT_UPSTREAM_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_UPSTREAM_MODEL: &str = "google/gemma-7b-it";

/// Upstream chat completion provider configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    /// Provider name for logging
    pub provider_name: String,
    /// Model requested for every completion
    pub model: String,
}

impl ProxyConfig {
    pub fn new(base_url: String, api_key: Option<String>, model: String) -> Self {
        let base_url = normalize_base_url(&base_url);
        let provider_name = if base_url.contains("openrouter.ai") {
            "openrouter".to_string()
        } else if base_url.contains("api.openai.com") {
            "openai".to_string()
        } else {
            "custom".to_string()
        };

        ProxyConfig {
            base_url,
            api_key: api_key.filter(|k| !k.is_empty()),
            provider_name,
            model,
        }
    }

    pub fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

fn normalize_base_url(base_url: &str) -> String {
    base_url.trim().trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_name_detection() {
        let config = ProxyConfig::new(
            DEFAULT_UPSTREAM_BASE_URL.to_string(),
            Some("key".to_string()),
            DEFAULT_UPSTREAM_MODEL.to_string(),
        );
        assert_eq!(config.provider_name, "openrouter");

        let config = ProxyConfig::new(
            "https://api.openai.com/v1".to_string(),
            None,
            "gpt-4o-mini".to_string(),
        );
        assert_eq!(config.provider_name, "openai");

        let config = ProxyConfig::new(
            "http://localhost:8080/v1".to_string(),
            None,
            "local".to_string(),
        );
        assert_eq!(config.provider_name, "custom");
    }

    #[test]
    fn test_completions_url_strips_trailing_slash() {
        let config = ProxyConfig::new(
            "https://openrouter.ai/api/v1/ ".to_string(),
            None,
            DEFAULT_UPSTREAM_MODEL.to_string(),
        );
        assert_eq!(
            config.completions_url(),
            "https://openrouter.ai/api/v1/chat/completions"
        );
    }

    #[test]
    fn test_empty_api_key_is_dropped() {
        let config = ProxyConfig::new(
            DEFAULT_UPSTREAM_BASE_URL.to_string(),
            Some(String::new()),
            DEFAULT_UPSTREAM_MODEL.to_string(),
        );
        assert_eq!(config.api_key, None);
    }
}
