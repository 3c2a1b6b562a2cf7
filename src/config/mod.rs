use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub environment: Environment,
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub security: SecurityConfig,
    pub vision: VisionConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Environment {
    Development,
    Production,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub max_request_size_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection string; used in production when set.
    pub url: Option<String>,
    /// SQLite file path (or `:memory:`) for everything else.
    pub sqlite_path: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub enable_rate_limiting: bool,
    pub rate_limit_requests: u32,
    pub rate_limit_window_secs: u64,
    pub ai_rate_limit_requests: u32,
    pub ai_rate_limit_window_secs: u64,
    /// Closed-beta registration cap.
    pub max_testers: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionConfig {
    pub api_key: Option<String>,
    pub api_url: String,
    pub model: String,
    pub max_tokens: u32,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let environment = match env::var("APP_ENV").as_deref() {
            Ok("production") | Ok("prod") => Environment::Production,
            _ => Environment::Development,
        };

        // Set defaults based on environment, then override with specific env vars
        match environment {
            Environment::Production => Self::production(),
            Environment::Development => Self::development(),
        }
        .with_env_overrides()
    }

    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }

    fn with_env_overrides(mut self) -> Self {
        // Server overrides
        if let Ok(v) = env::var("PORT") {
            self.server.port = v.parse().unwrap_or(self.server.port);
        }
        if let Ok(v) = env::var("MAX_REQUEST_SIZE_BYTES") {
            self.server.max_request_size_bytes =
                v.parse().unwrap_or(self.server.max_request_size_bytes);
        }

        // Database overrides
        if let Ok(v) = env::var("DATABASE_URL") {
            if !v.is_empty() {
                self.database.url = Some(v);
            }
        }
        if let Ok(v) = env::var("DATABASE_PATH") {
            if !v.is_empty() {
                self.database.sqlite_path = v;
            }
        }
        if let Ok(v) = env::var("DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = v.parse().unwrap_or(self.database.max_connections);
        }

        // API overrides
        if let Ok(v) = env::var("API_ENABLE_RATE_LIMITING") {
            self.api.enable_rate_limiting = v.parse().unwrap_or(self.api.enable_rate_limiting);
        }
        if let Ok(v) = env::var("API_RATE_LIMIT_REQUESTS") {
            self.api.rate_limit_requests = v.parse().unwrap_or(self.api.rate_limit_requests);
        }
        if let Ok(v) = env::var("API_RATE_LIMIT_WINDOW_SECS") {
            self.api.rate_limit_window_secs =
                v.parse().unwrap_or(self.api.rate_limit_window_secs);
        }
        if let Ok(v) = env::var("API_AI_RATE_LIMIT_REQUESTS") {
            self.api.ai_rate_limit_requests =
                v.parse().unwrap_or(self.api.ai_rate_limit_requests);
        }
        if let Ok(v) = env::var("API_AI_RATE_LIMIT_WINDOW_SECS") {
            self.api.ai_rate_limit_window_secs =
                v.parse().unwrap_or(self.api.ai_rate_limit_window_secs);
        }
        if let Ok(v) = env::var("API_MAX_TESTERS") {
            self.api.max_testers = v.parse().unwrap_or(self.api.max_testers);
        }

        // Security overrides
        if let Ok(v) = env::var("ALLOWED_ORIGINS") {
            self.security.allowed_origins = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        // Vision overrides
        if let Ok(v) = env::var("ANTHROPIC_API_KEY") {
            if !v.is_empty() {
                self.vision.api_key = Some(v);
            }
        }
        if let Ok(v) = env::var("VISION_API_URL") {
            self.vision.api_url = v;
        }
        if let Ok(v) = env::var("VISION_MODEL") {
            self.vision.model = v;
        }
        if let Ok(v) = env::var("VISION_MAX_TOKENS") {
            self.vision.max_tokens = v.parse().unwrap_or(self.vision.max_tokens);
        }

        self
    }

    fn development() -> Self {
        Self {
            environment: Environment::Development,
            server: ServerConfig {
                port: 3000,
                max_request_size_bytes: 10 * 1024 * 1024, // 10MB, image uploads
            },
            database: DatabaseConfig {
                url: None,
                sqlite_path: "brewbuddy.db".to_string(),
                max_connections: 5,
            },
            api: ApiConfig {
                enable_rate_limiting: false,
                rate_limit_requests: 100,
                rate_limit_window_secs: 15 * 60,
                ai_rate_limit_requests: 10,
                ai_rate_limit_window_secs: 60 * 60,
                max_testers: 10,
            },
            security: SecurityConfig {
                allowed_origins: vec![
                    "http://localhost:3000".to_string(),
                    "http://localhost:5173".to_string(),
                    "http://127.0.0.1:5173".to_string(),
                ],
            },
            vision: VisionConfig {
                api_key: None,
                api_url: "https://api.anthropic.com/v1/messages".to_string(),
                model: "claude-sonnet-4-20250514".to_string(),
                max_tokens: 1024,
            },
        }
    }

    fn production() -> Self {
        Self {
            environment: Environment::Production,
            server: ServerConfig {
                port: 3000,
                max_request_size_bytes: 10 * 1024 * 1024,
            },
            database: DatabaseConfig {
                url: None,
                sqlite_path: "brewbuddy.db".to_string(),
                max_connections: 20,
            },
            api: ApiConfig {
                enable_rate_limiting: true,
                rate_limit_requests: 100,
                rate_limit_window_secs: 15 * 60,
                ai_rate_limit_requests: 10,
                ai_rate_limit_window_secs: 60 * 60,
                max_testers: 10,
            },
            security: SecurityConfig {
                // Production origins come exclusively from ALLOWED_ORIGINS
                allowed_origins: vec![],
            },
            vision: VisionConfig {
                api_key: None,
                api_url: "https://api.anthropic.com/v1/messages".to_string(),
                model: "claude-sonnet-4-20250514".to_string(),
                max_tokens: 1024,
            },
        }
    }
}

// Global singleton config - initialized once at startup
pub static CONFIG: Lazy<AppConfig> = Lazy::new(AppConfig::from_env);

// Convenience function for accessing config
pub fn config() -> &'static AppConfig {
    &CONFIG
}
