// Card layout: turns a photo and a caption into the draw commands for one card.

use std::path::{Path, PathBuf};

use crate::compositor::DrawCommand;
use crate::config::{LayoutConfig, Region};
use crate::pipeline::{DeviceSelection, PrintJobSpec};

#[derive(Debug, Clone)]
pub struct PrintTemplate {
    layout: LayoutConfig,
    background_path: Option<PathBuf>,
}

impl PrintTemplate {
    pub fn new(layout: LayoutConfig) -> Self {
        PrintTemplate {
            layout,
            background_path: None,
        }
    }

    pub fn with_background(mut self, path: impl Into<PathBuf>) -> Self {
        self.background_path = Some(path.into());
        self
    }

    /// Background first, then the photo, then the caption.
    ///
    /// An empty caption is left off the card rather than sent as a text draw.
    pub fn build(&self, photo_path: &Path, text: &str) -> PrintJobSpec {
        let mut commands = Vec::with_capacity(3);

        if let Some(background) = &self.background_path {
            commands.push(self.image(self.layout.background_rect, background));
        }
        commands.push(self.image(self.layout.photo_rect, photo_path));

        let text = text.trim();
        if !text.is_empty() {
            let (x, y) = self.layout.text_origin;
            commands.push(DrawCommand::Text {
                page: self.layout.page,
                panel: self.layout.panel,
                x,
                y,
                text: text.to_string(),
                font_name: self.layout.text_font.clone(),
                font_size: self.layout.text_font_size,
                style: self.layout.text_style,
                color: self.layout.text_color,
            });
        }

        PrintJobSpec {
            commands,
            selection: DeviceSelection::FirstEnumerated,
        }
    }

    fn image(&self, region: Region, path: &Path) -> DrawCommand {
        DrawCommand::Image {
            page: self.layout.page,
            panel: self.layout.panel,
            x: region.x,
            y: region.y,
            width: region.width,
            height: region.height,
            source_path: path.to_path_buf(),
        }
    }
}
