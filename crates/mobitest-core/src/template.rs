//! Template images and on-screen template matching.
//!
//! A [`Template`] is a cropped reference screenshot of a UI element. Matching
//! locates it in a full screenshot using normalized cross-correlation on
//! grayscale images, so uniform brightness shifts do not affect the score.
//!
//! Matching runs on a downscaled copy of the screen (at most 480 px wide) and
//! searches coarse-to-fine: a low-resolution pass proposes candidates which
//! are then refined at working resolution.
//!
//! # Example
//!
//! ```no_run
//! use mobitest_core::template::Template;
//!
//! let login = Template::new("templates/login.png")
//!     .record_pos(0.0, 0.42)
//!     .resolution(1080, 1920)
//!     .threshold(0.8);
//!
//! let screen = image::open("screen.png").unwrap();
//! if let Some(m) = login.match_in(&screen).unwrap() {
//!     println!("found at {:?} ({:.2})", m.center, m.confidence);
//! }
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Widest screen size matching works at.
const WORKING_WIDTH: u32 = 480;
/// Smallest template side kept by the coarse pass.
const MIN_COARSE_SIDE: u32 = 8;
/// Coarse candidates may score this much below the threshold and still be refined.
const COARSE_SLACK: f64 = 0.25;
const MAX_CANDIDATES: usize = 20;

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("Failed to load template {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("Image decode error: {0}")]
    Decode(#[from] image::ImageError),
}

/// A successful template match, in screenshot pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Match {
    /// The point to act on (honours [`Template::target_pos`]).
    pub center: (i32, i32),
    /// `(x, y, width, height)` of the matched area.
    pub rect: (i32, i32, i32, i32),
    pub confidence: f64,
}

/// Reference image of a UI element.
#[derive(Clone)]
pub struct Template {
    pub path: PathBuf,
    pub threshold: f64,
    /// Position recorded relative to the screen center, normalized by screen width.
    pub record_pos: Option<(f64, f64)>,
    /// Screen size the template was cropped from.
    pub resolution: Option<(u32, u32)>,
    /// Keypad position (1..=9) of the action point within the match; 5 is the center.
    pub target_pos: u8,
    image: OnceLock<Arc<GrayImage>>,
}

impl fmt::Debug for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Template")
            .field("path", &self.path)
            .field("threshold", &self.threshold)
            .field("record_pos", &self.record_pos)
            .field("resolution", &self.resolution)
            .field("target_pos", &self.target_pos)
            .finish()
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or_else(|| self.path.to_string_lossy());
        write!(f, "Template({name})")
    }
}

impl From<&str> for Template {
    fn from(path: &str) -> Self {
        Template::new(path)
    }
}

impl Template {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            threshold: 0.7,
            record_pos: None,
            resolution: None,
            target_pos: 5,
            image: OnceLock::new(),
        }
    }

    /// Builds a template from an in-memory image. `name` stands in for the path.
    pub fn from_image(name: impl Into<PathBuf>, image: &DynamicImage) -> Self {
        let template = Self::new(name);
        let _ = template.image.set(Arc::new(image.to_luma8()));
        template
    }

    pub fn record_pos(mut self, x: f64, y: f64) -> Self {
        self.record_pos = Some((x, y));
        self
    }

    pub fn resolution(mut self, width: u32, height: u32) -> Self {
        self.resolution = Some((width, height));
        self
    }

    pub fn threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn target_pos(mut self, pos: u8) -> Self {
        self.target_pos = pos.clamp(1, 9);
        self
    }

    /// Resolves the template path against `dir` when it is relative.
    pub fn in_dir(mut self, dir: &Path) -> Self {
        if self.path.is_relative() {
            self.path = dir.join(&self.path);
        }
        self
    }

    fn gray(&self) -> Result<Arc<GrayImage>, TemplateError> {
        if let Some(img) = self.image.get() {
            return Ok(img.clone());
        }
        let img = image::open(&self.path).map_err(|source| TemplateError::Load {
            path: self.path.clone(),
            source,
        })?;
        Ok(self.image.get_or_init(|| Arc::new(img.to_luma8())).clone())
    }

    /// Finds the best match above the threshold.
    pub fn match_in(&self, screen: &DynamicImage) -> Result<Option<Match>, TemplateError> {
        let prepared = self.prepare(screen)?;
        let Some(prepared) = prepared else {
            return Ok(None);
        };

        if let Some(roi) = prepared.predicted_region(self) {
            if let Some(found) = prepared.best(Some(roi), self.threshold) {
                return Ok(Some(prepared.to_screen(self, found)));
            }
        }
        Ok(prepared
            .best(None, self.threshold)
            .map(|found| prepared.to_screen(self, found)))
    }

    /// Finds all non-overlapping matches above the threshold, best first.
    pub fn match_all(&self, screen: &DynamicImage) -> Result<Vec<Match>, TemplateError> {
        let Some(prepared) = self.prepare(screen)? else {
            return Ok(Vec::new());
        };
        Ok(prepared
            .all(self.threshold)
            .into_iter()
            .map(|found| prepared.to_screen(self, found))
            .collect())
    }

    /// Decodes a PNG screenshot and matches against it.
    pub fn match_in_png(&self, png: &[u8]) -> Result<Option<Match>, TemplateError> {
        let screen = image::load_from_memory(png)?;
        self.match_in(&screen)
    }

    fn prepare(&self, screen: &DynamicImage) -> Result<Option<Prepared>, TemplateError> {
        let tpl = self.gray()?;
        let screen = screen.to_luma8();
        let (sw, sh) = screen.dimensions();
        if sw == 0 || sh == 0 {
            return Ok(None);
        }

        let resolution_scale = match self.resolution {
            Some((rw, rh)) if rw > 0 && rh > 0 => {
                (sw as f64 / rw as f64).min(sh as f64 / rh as f64)
            }
            _ => 1.0,
        };
        let work_scale = (WORKING_WIDTH as f64 / sw as f64).min(1.0);

        let work_screen = scale_image(&screen, work_scale);
        let work_tpl = scale_image(&tpl, resolution_scale * work_scale);
        if work_tpl.width() > work_screen.width() || work_tpl.height() > work_screen.height() {
            return Ok(None);
        }

        Ok(Some(Prepared::new(work_screen, work_tpl, work_scale, (sw, sh))))
    }
}

fn scale_image(img: &GrayImage, scale: f64) -> GrayImage {
    if (scale - 1.0).abs() < f64::EPSILON {
        return img.clone();
    }
    let w = ((img.width() as f64 * scale).round() as u32).max(1);
    let h = ((img.height() as f64 * scale).round() as u32).max(1);
    imageops::resize(img, w, h, FilterType::Triangle)
}

// ---------------------------------------------------------------------------
// Normalized cross-correlation
// ---------------------------------------------------------------------------

/// Summed-area tables for window sums and sums of squares.
struct Integral {
    stride: usize,
    sum: Vec<f64>,
    sq: Vec<f64>,
}

impl Integral {
    fn new(img: &GrayImage) -> Self {
        let (w, h) = (img.width() as usize, img.height() as usize);
        let stride = w + 1;
        let mut sum = vec![0.0; stride * (h + 1)];
        let mut sq = vec![0.0; stride * (h + 1)];
        let raw = img.as_raw();
        for y in 0..h {
            let mut row_sum = 0.0;
            let mut row_sq = 0.0;
            for x in 0..w {
                let v = raw[y * w + x] as f64;
                row_sum += v;
                row_sq += v * v;
                let idx = (y + 1) * stride + x + 1;
                sum[idx] = sum[idx - stride] + row_sum;
                sq[idx] = sq[idx - stride] + row_sq;
            }
        }
        Self { stride, sum, sq }
    }

    fn window(&self, x: u32, y: u32, w: u32, h: u32) -> (f64, f64) {
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = (x0 + w as usize, y0 + h as usize);
        let at = |t: &[f64], x: usize, y: usize| t[y * self.stride + x];
        let s = at(&self.sum, x1, y1) - at(&self.sum, x0, y1) - at(&self.sum, x1, y0) + at(&self.sum, x0, y0);
        let q = at(&self.sq, x1, y1) - at(&self.sq, x0, y1) - at(&self.sq, x1, y0) + at(&self.sq, x0, y0);
        (s, q)
    }
}

/// One search level: a screen, a template and precomputed statistics.
struct Level {
    screen: GrayImage,
    integral: Integral,
    tpl_w: u32,
    tpl_h: u32,
    centered: Vec<f64>,
    norm: f64,
}

impl Level {
    fn new(screen: GrayImage, tpl: &GrayImage) -> Self {
        let n = (tpl.width() * tpl.height()) as f64;
        let mean = tpl.as_raw().iter().map(|&v| v as f64).sum::<f64>() / n;
        let centered: Vec<f64> = tpl.as_raw().iter().map(|&v| v as f64 - mean).collect();
        let norm = centered.iter().map(|v| v * v).sum::<f64>().sqrt();
        Self {
            integral: Integral::new(&screen),
            screen,
            tpl_w: tpl.width(),
            tpl_h: tpl.height(),
            centered,
            norm,
        }
    }

    fn max_x(&self) -> u32 {
        self.screen.width() - self.tpl_w
    }

    fn max_y(&self) -> u32 {
        self.screen.height() - self.tpl_h
    }

    fn score(&self, x: u32, y: u32) -> f64 {
        let n = (self.tpl_w * self.tpl_h) as f64;
        let (s, q) = self.integral.window(x, y, self.tpl_w, self.tpl_h);
        let var = q - s * s / n;
        if var <= 1e-6 || self.norm <= 1e-6 {
            return 0.0;
        }
        let raw = self.screen.as_raw();
        let sw = self.screen.width() as usize;
        let tw = self.tpl_w as usize;
        let mut cross = 0.0;
        for j in 0..self.tpl_h as usize {
            let row = (y as usize + j) * sw + x as usize;
            let trow = j * tw;
            for i in 0..tw {
                cross += raw[row + i] as f64 * self.centered[trow + i];
            }
        }
        (cross / (self.norm * var.sqrt())).clamp(-1.0, 1.0)
    }

    /// Scores every top-left position in `[x0, x1] x [y0, y1]` and keeps those above `min`.
    fn scan(&self, (x0, y0, x1, y1): (u32, u32, u32, u32), min: f64) -> Vec<(u32, u32, f64)> {
        let x1 = x1.min(self.max_x());
        let y1 = y1.min(self.max_y());
        let mut hits = Vec::new();
        for y in y0..=y1 {
            for x in x0..=x1 {
                let score = self.score(x, y);
                if score >= min {
                    hits.push((x, y, score));
                }
            }
        }
        hits
    }

    fn full_region(&self) -> (u32, u32, u32, u32) {
        (0, 0, self.max_x(), self.max_y())
    }
}

/// Keeps the best hits whose windows do not overlap by more than half.
fn suppress(mut hits: Vec<(u32, u32, f64)>, w: u32, h: u32, limit: usize) -> Vec<(u32, u32, f64)> {
    hits.sort_by(|a, b| b.2.total_cmp(&a.2));
    let mut kept: Vec<(u32, u32, f64)> = Vec::new();
    for hit in hits {
        let overlaps = kept.iter().any(|k| {
            (k.0 as i64 - hit.0 as i64).unsigned_abs() < (w as u64).div_ceil(2)
                && (k.1 as i64 - hit.1 as i64).unsigned_abs() < (h as u64).div_ceil(2)
        });
        if !overlaps {
            kept.push(hit);
            if kept.len() >= limit {
                break;
            }
        }
    }
    kept
}

struct Prepared {
    work: Level,
    coarse: Option<(Level, u32)>,
    work_scale: f64,
    screen_size: (u32, u32),
}

impl Prepared {
    fn new(screen: GrayImage, tpl: GrayImage, work_scale: f64, screen_size: (u32, u32)) -> Self {
        let factor = [4u32, 2]
            .into_iter()
            .find(|f| tpl.width().min(tpl.height()) / f >= MIN_COARSE_SIDE);
        let coarse = factor.map(|f| {
            let scale = 1.0 / f as f64;
            (Level::new(scale_image(&screen, scale), &scale_image(&tpl, scale)), f)
        });
        Self {
            work: Level::new(screen, &tpl),
            coarse,
            work_scale,
            screen_size,
        }
    }

    /// Search region around the recorded position, in working pixels.
    fn predicted_region(&self, template: &Template) -> Option<(u32, u32, u32, u32)> {
        let (rx, ry) = template.record_pos?;
        let w = self.work.screen.width() as f64;
        let h = self.work.screen.height() as f64;
        let cx = w / 2.0 + rx * w;
        let cy = h / 2.0 + ry * w;
        let margin_x = self.work.tpl_w as f64 * 1.5 + w * 0.15;
        let margin_y = self.work.tpl_h as f64 * 1.5 + w * 0.15;
        let x0 = (cx - margin_x).max(0.0) as u32;
        let y0 = (cy - margin_y).max(0.0) as u32;
        let x1 = (cx + margin_x).max(0.0) as u32;
        let y1 = (cy + margin_y).max(0.0) as u32;
        if x0 > self.work.max_x() || y0 > self.work.max_y() {
            return None;
        }
        Some((x0, y0, x1, y1))
    }

    /// Candidates above `threshold` inside `region` (working pixels), best first.
    fn candidates(&self, region: Option<(u32, u32, u32, u32)>, threshold: f64, limit: usize) -> Vec<(u32, u32, f64)> {
        let region = region.unwrap_or_else(|| self.work.full_region());

        let Some((coarse, f)) = &self.coarse else {
            let hits = self.work.scan(region, threshold);
            return suppress(hits, self.work.tpl_w, self.work.tpl_h, limit);
        };

        let coarse_region = (region.0 / f, region.1 / f, region.2 / f, region.3 / f);
        let seeds = suppress(
            coarse.scan(coarse_region, threshold - COARSE_SLACK),
            coarse.tpl_w,
            coarse.tpl_h,
            MAX_CANDIDATES,
        );

        let refined: Vec<(u32, u32, f64)> = seeds
            .into_iter()
            .filter_map(|(cx, cy, _)| {
                let x0 = (cx * f).saturating_sub(*f).max(region.0);
                let y0 = (cy * f).saturating_sub(*f).max(region.1);
                let window = (x0, y0, (cx * f + f).min(region.2), (cy * f + f).min(region.3));
                if window.0 > window.2.min(self.work.max_x()) || window.1 > window.3.min(self.work.max_y()) {
                    return None;
                }
                self.work
                    .scan(window, threshold)
                    .into_iter()
                    .max_by(|a, b| a.2.total_cmp(&b.2))
            })
            .collect();
        suppress(refined, self.work.tpl_w, self.work.tpl_h, limit)
    }

    fn best(&self, region: Option<(u32, u32, u32, u32)>, threshold: f64) -> Option<(u32, u32, f64)> {
        self.candidates(region, threshold, 1).into_iter().next()
    }

    fn all(&self, threshold: f64) -> Vec<(u32, u32, f64)> {
        self.candidates(None, threshold, MAX_CANDIDATES)
    }

    fn to_screen(&self, template: &Template, (x, y, score): (u32, u32, f64)) -> Match {
        let inv = 1.0 / self.work_scale;
        let rx = (x as f64 * inv).round() as i32;
        let ry = (y as f64 * inv).round() as i32;
        let rw = (self.work.tpl_w as f64 * inv).round() as i32;
        let rh = (self.work.tpl_h as f64 * inv).round() as i32;

        let pos = template.target_pos.clamp(1, 9) as i32 - 1;
        let (col, row) = (pos % 3, pos / 3);
        let cx = (rx + rw * col / 2).min(self.screen_size.0 as i32 - 1);
        let cy = (ry + rh * row / 2).min(self.screen_size.1 as i32 - 1);

        Match {
            center: (cx, cy),
            rect: (rx, ry, rw, rh),
            confidence: score,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    /// A deterministic textured screen so every window has a distinct signature.
    fn textured_screen(w: u32, h: u32) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| {
            let v = (x.wrapping_mul(7919) ^ y.wrapping_mul(104729)).wrapping_mul(2654435761) >> 24;
            Luma([v as u8])
        })
    }

    fn crop(img: &GrayImage, x: u32, y: u32, w: u32, h: u32) -> DynamicImage {
        DynamicImage::ImageLuma8(imageops::crop_imm(img, x, y, w, h).to_image())
    }

    #[test]
    fn finds_cropped_patch() {
        let screen = textured_screen(200, 300);
        let tpl = Template::from_image("patch.png", &crop(&screen, 120, 40, 24, 20));

        let m = tpl.match_in(&DynamicImage::ImageLuma8(screen)).unwrap().unwrap();
        assert_eq!(m.rect, (120, 40, 24, 20));
        assert_eq!(m.center, (132, 50));
        assert!(m.confidence > 0.99, "confidence {}", m.confidence);
    }

    #[test]
    fn finds_patch_on_large_screen_via_downscale() {
        let screen = textured_screen(960, 600);
        // Smooth the screen so the downscaled copy keeps the patch recognizable.
        let screen = imageops::blur(&screen, 3.0);
        let tpl = Template::from_image("big.png", &crop(&screen, 400, 300, 96, 80));

        let m = tpl.match_in(&DynamicImage::ImageLuma8(screen)).unwrap().unwrap();
        assert!((m.rect.0 - 400).abs() <= 2, "{:?}", m.rect);
        assert!((m.rect.1 - 300).abs() <= 2, "{:?}", m.rect);
    }

    #[test]
    fn respects_threshold() {
        let screen = textured_screen(120, 120);
        let other = textured_screen(200, 200);
        // A patch from a different image should not match strongly.
        let tpl = Template::from_image("foreign.png", &crop(&other, 150, 170, 16, 16)).threshold(0.95);
        assert!(tpl.match_in(&DynamicImage::ImageLuma8(screen)).unwrap().is_none());
    }

    #[test]
    fn template_larger_than_screen_is_no_match() {
        let screen = textured_screen(40, 40);
        let big = textured_screen(80, 80);
        let tpl = Template::from_image("huge.png", &DynamicImage::ImageLuma8(big));
        assert!(tpl.match_in(&DynamicImage::ImageLuma8(screen)).unwrap().is_none());
    }

    #[test]
    fn target_pos_picks_corner() {
        let screen = textured_screen(100, 100);
        let tpl = Template::from_image("p.png", &crop(&screen, 10, 20, 20, 10)).target_pos(1);
        let m = tpl.match_in(&DynamicImage::ImageLuma8(screen.clone())).unwrap().unwrap();
        assert_eq!(m.center, (10, 20));

        let tpl = tpl.target_pos(9);
        let m = tpl.match_in(&DynamicImage::ImageLuma8(screen)).unwrap().unwrap();
        assert_eq!(m.center, (30, 30));
    }

    #[test]
    fn match_all_finds_repeated_patch() {
        let patch = textured_screen(12, 12);
        // Background ripple keeps windows from being flat.
        let mut screen = GrayImage::from_fn(100, 60, |x, y| Luma([20 + ((x * 3 + y * 5) % 7) as u8]));
        imageops::replace(&mut screen, &patch, 5, 5);
        imageops::replace(&mut screen, &patch, 70, 40);

        let tpl = Template::from_image("dup.png", &DynamicImage::ImageLuma8(patch)).threshold(0.9);
        let matches = tpl.match_all(&DynamicImage::ImageLuma8(screen)).unwrap();
        let mut origins: Vec<(i32, i32)> = matches.iter().map(|m| (m.rect.0, m.rect.1)).collect();
        origins.sort();
        assert_eq!(origins, vec![(5, 5), (70, 40)]);
    }

    #[test]
    fn missing_file_reports_path() {
        let tpl = Template::new("/nonexistent/button.png");
        let screen = DynamicImage::ImageLuma8(textured_screen(10, 10));
        let err = tpl.match_in(&screen).unwrap_err();
        assert!(err.to_string().contains("button.png"));
    }

    #[test]
    fn in_dir_only_rewrites_relative_paths() {
        let rel = Template::new("a.png").in_dir(Path::new("/tpl"));
        assert_eq!(rel.path, PathBuf::from("/tpl/a.png"));
        let abs = Template::new("/x/a.png").in_dir(Path::new("/tpl"));
        assert_eq!(abs.path, PathBuf::from("/x/a.png"));
        assert_eq!(abs.to_string(), "Template(a.png)");
    }
}
