use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::compositor::{Color, TextStyle};
use crate::errors::ConfigError;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub driver: DriverConfig,
    pub storage: StorageConfig,
    pub layout: LayoutConfig,
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DriverConfig {
    pub library_path: PathBuf,
    pub use_mock: bool,
    pub call_timeout: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub base_path: PathBuf,
    pub static_path: PathBuf,
}

/// Rectangle on the card in driver units. A zero size lets the driver pick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Region {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl FromStr for Region {
    type Err = ();

    /// Parses `x,y,width,height`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = s
            .split(',')
            .map(|p| p.trim().parse::<i32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| ())?;
        match parts.as_slice() {
            &[x, y, width, height] if width >= 0 && height >= 0 => Ok(Region {
                x,
                y,
                width,
                height,
            }),
            _ => Err(()),
        }
    }
}

/// Where the kiosk puts things on the card.
#[derive(Debug, Clone, Deserialize)]
pub struct LayoutConfig {
    pub page: u8,
    pub panel: u8,
    pub background_rect: Region,
    pub photo_rect: Region,
    pub text_origin: (i32, i32),
    pub text_font: String,
    pub text_font_size: i32,
    pub text_style: TextStyle,
    pub text_color: Color,
    pub background_filename: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl DatabaseConfig {
    pub fn connection_string(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.path.display())
    }
}

fn env_or(var: &str, default: &str) -> String {
    std::env::var(var).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: FromStr>(var: &'static str, default: &str) -> Result<T, ConfigError> {
    let value = env_or(var, default);
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue { var, value })
}

fn parse_origin(var: &'static str, default: &str) -> Result<(i32, i32), ConfigError> {
    let value = env_or(var, default);
    let mut parts = value.split(',').map(|p| p.trim().parse::<i32>());
    match (parts.next(), parts.next(), parts.next()) {
        (Some(Ok(x)), Some(Ok(y)), None) => Ok((x, y)),
        _ => Err(ConfigError::InvalidValue { var, value }),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let server = ServerConfig {
            host: env_or("HOST", "0.0.0.0"),
            port: env_or("PORT", "8080")
                .parse()
                .map_err(|_| ConfigError::InvalidPort)?,
        };

        let timeout_ms: u64 = env_or("DRIVER_CALL_TIMEOUT_MS", "10000")
            .parse()
            .map_err(|_| ConfigError::InvalidTimeout)?;
        let driver = DriverConfig {
            library_path: env_or("SMART_DRIVER_PATH", "SmartComm2.dll").into(),
            use_mock: parse_env("USE_MOCK_DRIVER", "false")?,
            call_timeout: Duration::from_millis(timeout_ms),
        };

        let base_path = env_or("STORAGE_PATH", "/usr/local/share/card_kiosk");
        let storage = StorageConfig {
            base_path: PathBuf::from(&base_path),
            static_path: PathBuf::from(&base_path).join("static"),
        };

        let layout = LayoutConfig {
            page: parse_env("PRINT_PAGE", "0")?,
            panel: parse_env("PRINT_PANEL", "1")?,
            background_rect: parse_env("BACKGROUND_RECT", "0,0,0,0")?,
            photo_rect: parse_env("PHOTO_RECT", "40,60,420,560")?,
            text_origin: parse_origin("TEXT_ORIGIN", "500,520")?,
            text_font: env_or("TEXT_FONT", "Arial"),
            text_font_size: parse_env("TEXT_FONT_SIZE", "24")?,
            text_style: TextStyle(parse_env("TEXT_STYLE", "0")?),
            text_color: parse_env("TEXT_COLOR", "#000000")?,
            background_filename: env_or("BACKGROUND_FILENAME", "card_background.png"),
        };

        let database = DatabaseConfig {
            path: env_or("DATABASE_PATH", &format!("{}/card_kiosk.db", base_path)).into(),
        };

        let config = Config {
            server,
            driver,
            storage,
            layout,
            database,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if self.driver.call_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout);
        }
        if self.layout.text_font_size <= 0 {
            return Err(ConfigError::InvalidValue {
                var: "TEXT_FONT_SIZE",
                value: self.layout.text_font_size.to_string(),
            });
        }
        Ok(())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr = format!("{}:{}", self.server.host, self.server.port);
        addr.parse().map_err(|_| ConfigError::InvalidValue {
            var: "HOST",
            value: addr,
        })
    }

    /// Directory that uploaded photos are resolved against.
    pub fn photos_path(&self) -> PathBuf {
        self.storage.base_path.clone()
    }

    pub fn background_path(&self) -> PathBuf {
        self.storage
            .static_path
            .join(&self.layout.background_filename)
    }
}
