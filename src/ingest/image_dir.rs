//! Local still-image frame source.
//!
//! Replays the `.jpg`/`.jpeg`/`.png` files of one local directory in file-name
//! order, optionally looping. Useful for bench testing a deployment against
//! captured footage without a camera attached.

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};

use super::{FrameSource, SourceStats};
use crate::frame::Frame;

pub struct ImageDirSource {
    dir: PathBuf,
    looping: bool,
    files: Vec<PathBuf>,
    cursor: usize,
    frame_count: u64,
    last_error: Option<String>,
}

impl ImageDirSource {
    pub fn new(dir: impl AsRef<Path>, looping: bool) -> Result<Self> {
        let dir = dir.as_ref();
        if dir.as_os_str().is_empty() {
            return Err(anyhow!("image directory path must not be empty"));
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            looping,
            files: Vec::new(),
            cursor: 0,
            frame_count: 0,
            last_error: None,
        })
    }

    fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("failed to read image directory {}", dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            if path.is_file() && is_supported_image(&path) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

impl FrameSource for ImageDirSource {
    fn connect(&mut self) -> Result<()> {
        self.files = Self::list_images(&self.dir)?;
        if self.files.is_empty() {
            return Err(anyhow!("no images found in {}", self.dir.display()));
        }
        self.cursor = 0;
        log::info!(
            "ImageDirSource: {} images in {}",
            self.files.len(),
            self.dir.display()
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.files.is_empty() {
            return Err(anyhow!("image source not connected"));
        }
        if self.cursor >= self.files.len() {
            if !self.looping {
                return Ok(None);
            }
            self.cursor = 0;
        }
        let path = &self.files[self.cursor];
        self.cursor += 1;

        let image = match image::open(path) {
            Ok(image) => image.to_rgb8(),
            Err(e) => {
                self.last_error = Some(e.to_string());
                return Err(anyhow!("failed to decode {}: {}", path.display(), e));
            }
        };
        self.last_error = None;
        self.frame_count += 1;
        Ok(Some(Frame::new(image, self.frame_count)))
    }

    fn is_healthy(&self) -> bool {
        !self.files.is_empty() && self.last_error.is_none()
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            uri: format!("dir://{}", self.dir.display()),
        }
    }

    fn release(&mut self) {
        self.files.clear();
        self.cursor = 0;
    }
}

fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| matches!(ext.to_ascii_lowercase().as_str(), "jpg" | "jpeg" | "png"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn write_png(dir: &Path, name: &str, width: u32) {
        let img = RgbImage::from_pixel(width, 10, Rgb([1, 2, 3]));
        img.save(dir.join(name)).expect("write png");
    }

    #[test]
    fn replays_images_in_name_order() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_png(dir.path(), "b.png", 20);
        write_png(dir.path(), "a.png", 10);
        std::fs::write(dir.path().join("notes.txt"), b"ignored")?;

        let mut source = ImageDirSource::new(dir.path(), false)?;
        source.connect()?;
        assert_eq!(source.next_frame()?.map(|f| f.width()), Some(10));
        assert_eq!(source.next_frame()?.map(|f| f.width()), Some(20));
        assert!(source.next_frame()?.is_none());
        Ok(())
    }

    #[test]
    fn looping_source_wraps_around() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_png(dir.path(), "only.png", 12);

        let mut source = ImageDirSource::new(dir.path(), true)?;
        source.connect()?;
        for _ in 0..3 {
            assert!(source.next_frame()?.is_some());
        }
        assert_eq!(source.stats().frames_captured, 3);
        Ok(())
    }

    #[test]
    fn empty_directory_fails_to_connect() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut source = ImageDirSource::new(dir.path(), true)?;
        assert!(source.connect().is_err());
        Ok(())
    }
}
