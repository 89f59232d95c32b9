// Draw commands and their translation into driver draw calls.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

use crate::device_session::DeviceSession;
use crate::driver::{Handle, PixelBuffer, Rect, Target};
use crate::errors::DriverError;
use crate::wire::{encode_wide, encode_wide_terminated, DrawTextInfo, FACE_NAME_UNITS};

/// Font style flags understood by the driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TextStyle(pub i32);

impl TextStyle {
    pub const REGULAR: Self = Self(0x00);
    pub const BOLD: Self = Self(0x01);
    pub const ITALIC: Self = Self(0x02);
    pub const UNDERLINE: Self = Self(0x04);
    pub const STRIKEOUT: Self = Self(0x08);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for TextStyle {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const BLACK: Self = Self { r: 0, g: 0, b: 0 };

    /// Packs as 0x00BBGGRR, the layout the driver expects.
    pub fn to_colorref(self) -> u32 {
        u32::from(self.r) | (u32::from(self.g) << 8) | (u32::from(self.b) << 16)
    }
}

impl FromStr for Color {
    type Err = String;

    /// Parses `#RRGGBB` or `RRGGBB`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s.trim().trim_start_matches('#');
        if hex.len() != 6 || !hex.is_ascii() {
            return Err(format!("expected #RRGGBB, got '{}'", s));
        }
        let channel = |range: std::ops::Range<usize>| {
            u8::from_str_radix(&hex[range], 16).map_err(|e| format!("'{}': {}", s, e))
        };
        Ok(Self {
            r: channel(0..2)?,
            g: channel(2..4)?,
            b: channel(4..6)?,
        })
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

/// One step of surface composition, applied synchronously in the order given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DrawCommand {
    Image {
        page: u8,
        panel: u8,
        x: i32,
        y: i32,
        width: i32,
        height: i32,
        source_path: PathBuf,
    },
    Text {
        page: u8,
        panel: u8,
        x: i32,
        y: i32,
        text: String,
        font_name: String,
        font_size: i32,
        style: TextStyle,
        color: Color,
    },
}

impl DrawCommand {
    pub fn kind(&self) -> &'static str {
        match self {
            DrawCommand::Image { .. } => "image",
            DrawCommand::Text { .. } => "text",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SurfaceCompositor {
    session: DeviceSession,
}

impl SurfaceCompositor {
    pub fn new(session: DeviceSession) -> Self {
        Self { session }
    }

    /// Applies a single command against `handle`.
    pub async fn apply(&self, command: &DrawCommand, handle: Handle) -> Result<(), DriverError> {
        let status = match command {
            DrawCommand::Image {
                page,
                panel,
                x,
                y,
                width,
                height,
                source_path,
            } => {
                let image = load_pixels(source_path.clone()).await?;
                let target = Target {
                    page: *page,
                    panel: *panel,
                };
                let rect = Rect {
                    x: *x,
                    y: *y,
                    width: *width,
                    height: *height,
                };
                info!(
                    "Drawing image {:?} ({}x{}) at {:?} on page {} panel {}",
                    source_path, image.width, image.height, rect, page, panel
                );
                self.session
                    .with_live_handle("drawImage", handle, move |driver, handle| {
                        driver.draw_image(handle, target, rect, &image)
                    })
                    .await?
            }
            DrawCommand::Text {
                page,
                panel,
                x,
                y,
                text,
                font_name,
                font_size,
                style,
                color,
            } => {
                if text.is_empty() {
                    return Err(DriverError::EmptyText);
                }
                let face_name =
                    encode_wide::<FACE_NAME_UNITS>(font_name).ok_or(DriverError::FieldTooLong {
                        field: "font name",
                        capacity: FACE_NAME_UNITS - 1,
                    })?;
                let info = DrawTextInfo {
                    x: *x,
                    y: *y,
                    cx: 0,
                    cy: 0,
                    rotate: 0,
                    align: 0,
                    font_height: *font_size,
                    font_width: 0,
                    style: style.0,
                    color: color.to_colorref(),
                    option: 0,
                    face_name,
                };
                let units = encode_wide_terminated(text);
                let target = Target {
                    page: *page,
                    panel: *panel,
                };
                info!(
                    "Drawing {} chars of text at ({}, {}) in {} {}pt {}",
                    text.chars().count(),
                    x,
                    y,
                    font_name,
                    font_size,
                    color
                );
                self.session
                    .with_live_handle("drawText", handle, move |driver, handle| {
                        driver.draw_text(handle, target, &info, &units)
                    })
                    .await?
            }
        };

        if status != 0 {
            warn!("Driver rejected {} draw with code {}", command.kind(), status);
            return Err(DriverError::DrawFailed(status));
        }
        Ok(())
    }
}

async fn load_pixels(path: PathBuf) -> Result<PixelBuffer, DriverError> {
    tokio::task::spawn_blocking(move || decode_image(&path))
        .await
        .map_err(|_| DriverError::CallAborted { call: "loadImage" })?
}

fn decode_image(path: &Path) -> Result<PixelBuffer, DriverError> {
    if !path.is_file() {
        return Err(DriverError::SourceNotFound(path.to_path_buf()));
    }
    let bytes =
        std::fs::read(path).map_err(|_| DriverError::SourceNotFound(path.to_path_buf()))?;
    let decoded = image::load_from_memory(&bytes).map_err(|e| DriverError::ImageDecode {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let rgb = decoded.to_rgb8();
    debug!("Decoded {:?} to {}x{} RGB", path, rgb.width(), rgb.height());
    Ok(PixelBuffer {
        width: rgb.width(),
        height: rgb.height(),
        pixels: rgb.into_raw(),
    })
}
