//! Process configuration from `AUTOMAGIK_OMNI_*` environment options.

use omnihub_server::CorsOptions;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub api_key: Option<String>,
    pub database_path: String,
    pub cors: CorsOptions,
}

impl Config {
    pub fn from_env() -> Self {
        let host = env_or("AUTOMAGIK_OMNI_API_HOST", "0.0.0.0");
        let port = env_or("AUTOMAGIK_OMNI_API_PORT", "8882")
            .parse()
            .unwrap_or(8882);
        let api_key = std::env::var("AUTOMAGIK_OMNI_API_KEY")
            .ok()
            .filter(|k| !k.is_empty());
        let database_path = database_path(&env_or(
            "AUTOMAGIK_OMNI_DATABASE_URL",
            "./data/omnihub.db",
        ));

        let defaults = CorsOptions::default();
        let cors = CorsOptions {
            origins: env_list("AUTOMAGIK_OMNI_CORS_ORIGINS").unwrap_or(defaults.origins),
            methods: env_list("AUTOMAGIK_OMNI_CORS_METHODS").unwrap_or(defaults.methods),
            headers: env_list("AUTOMAGIK_OMNI_CORS_HEADERS").unwrap_or(defaults.headers),
            credentials: std::env::var("AUTOMAGIK_OMNI_CORS_CREDENTIALS")
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(defaults.credentials),
        };

        Self {
            host,
            port,
            api_key,
            database_path,
            cors,
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_list(key: &str) -> Option<Vec<String>> {
    let raw = std::env::var(key).ok()?;
    let list: Vec<String> = raw
        .split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect();
    if list.is_empty() {
        None
    } else {
        Some(list)
    }
}

/// Accepts a plain path or a `sqlite:`-style URL.
pub fn database_path(url: &str) -> String {
    url.strip_prefix("sqlite:///")
        .map(|rest| format!("/{rest}"))
        .or_else(|| url.strip_prefix("sqlite://").map(str::to_string))
        .or_else(|| url.strip_prefix("sqlite:").map(str::to_string))
        .unwrap_or_else(|| url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_path_accepts_urls_and_paths() {
        assert_eq!(database_path("./data/omnihub.db"), "./data/omnihub.db");
        assert_eq!(database_path("sqlite:./data/omnihub.db"), "./data/omnihub.db");
        assert_eq!(database_path("sqlite://data/omnihub.db"), "data/omnihub.db");
        assert_eq!(
            database_path("sqlite:///var/lib/omnihub.db"),
            "/var/lib/omnihub.db"
        );
    }
}
