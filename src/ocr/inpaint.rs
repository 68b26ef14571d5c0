use anyhow::{Result, bail};
use image::{GrayImage, Luma, Rgb, RgbImage};
use imageproc::distance_transform::Norm;
use imageproc::morphology::dilate;
use serde::{Deserialize, Serialize};

use super::BBoxPx;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InpaintMethod {
    #[default]
    ContentAware,
    MeanFill,
}

/// Removes the pixels under `regions` and fills them from their surroundings.
pub trait Inpainter: Send + Sync {
    fn clean(&self, image: &RgbImage, regions: &[BBoxPx]) -> Result<RgbImage>;
}

/// Binary mask with 255 inside every non-empty region, clamped to the image.
pub fn build_mask(width: u32, height: u32, regions: &[BBoxPx]) -> GrayImage {
    let mut mask = GrayImage::new(width, height);
    for region in regions.iter().filter(|region| !region.is_empty()) {
        let x1 = (region.x + region.w).min(width);
        let y1 = (region.y + region.h).min(height);
        for y in region.y.min(height)..y1 {
            for x in region.x.min(width)..x1 {
                mask.put_pixel(x, y, Luma([255]));
            }
        }
    }
    mask
}

/// Cleans with `method`, dropping to mean fill if the content-aware pass fails.
pub fn clean_regions(image: &RgbImage, regions: &[BBoxPx], method: InpaintMethod) -> RgbImage {
    let regions: Vec<BBoxPx> = regions.iter().copied().filter(|r| !r.is_empty()).collect();
    if regions.is_empty() {
        return image.clone();
    }
    if method == InpaintMethod::ContentAware {
        match ContentAwareInpainter::default().clean(image, &regions) {
            Ok(cleaned) => return cleaned,
            Err(err) => tracing::warn!("content-aware inpaint failed, using mean fill: {:#}", err),
        }
    }
    MeanFillInpainter.fill(image, &regions)
}

/// Fills masked pixels layer by layer from the outside in, each pixel taking the
/// distance-weighted mean of already known pixels within `radius`.
#[derive(Debug, Clone, Copy)]
pub struct ContentAwareInpainter {
    pub radius: u32,
}

impl Default for ContentAwareInpainter {
    fn default() -> Self {
        Self { radius: 3 }
    }
}

impl Inpainter for ContentAwareInpainter {
    fn clean(&self, image: &RgbImage, regions: &[BBoxPx]) -> Result<RgbImage> {
        let (width, height) = image.dimensions();
        let mask = build_mask(width, height, regions);
        let mut known: Vec<bool> = mask.pixels().map(|p| p.0[0] == 0).collect();
        if !known.iter().any(|k| *k) {
            bail!("mask covers the whole image");
        }
        let masked = known.iter().filter(|k| !**k).count();
        let idx = |x: u32, y: u32| (y * width + x) as usize;

        // Each masked pixel enters the frontier once, when a neighbour becomes known.
        let mut queued = vec![false; known.len()];
        let mut layer: Vec<(u32, u32)> = Vec::new();
        for (x, y, p) in mask.enumerate_pixels() {
            if p.0[0] != 0 && has_known_neighbour(&known, width, height, x, y) {
                queued[idx(x, y)] = true;
                layer.push((x, y));
            }
        }

        let mut out = image.clone();
        let mut filled_count = 0usize;
        let mut next = Vec::new();
        while !layer.is_empty() {
            let values: Vec<Rgb<u8>> = layer
                .iter()
                .map(|&(x, y)| self.weighted_mean(&out, &known, x, y))
                .collect();
            for (&(x, y), value) in layer.iter().zip(values) {
                out.put_pixel(x, y, value);
                known[idx(x, y)] = true;
            }
            filled_count += layer.len();
            for &(x, y) in &layer {
                for (nx, ny) in neighbours(width, height, x, y) {
                    let i = idx(nx, ny);
                    if !known[i] && !queued[i] {
                        queued[i] = true;
                        next.push((nx, ny));
                    }
                }
            }
            layer.clear();
            std::mem::swap(&mut layer, &mut next);
        }
        if filled_count < masked {
            bail!("{} masked pixels are unreachable", masked - filled_count);
        }
        Ok(out)
    }
}

impl ContentAwareInpainter {
    /// Distance-weighted mean of the known pixels within `radius` of (x, y).
    fn weighted_mean(&self, out: &RgbImage, known: &[bool], x: u32, y: u32) -> Rgb<u8> {
        let (width, height) = out.dimensions();
        let radius = self.radius.max(1) as i64;
        let mut acc = [0.0f32; 3];
        let mut total = 0.0f32;
        for dy in -radius..=radius {
            for dx in -radius..=radius {
                let nx = x as i64 + dx;
                let ny = y as i64 + dy;
                if (dx, dy) == (0, 0) || nx < 0 || ny < 0 || nx >= width as i64 || ny >= height as i64 {
                    continue;
                }
                let (nx, ny) = (nx as u32, ny as u32);
                if !known[(ny * width + nx) as usize] {
                    continue;
                }
                let weight = 1.0 / (dx * dx + dy * dy) as f32;
                let px = out.get_pixel(nx, ny).0;
                for c in 0..3 {
                    acc[c] += px[c] as f32 * weight;
                }
                total += weight;
            }
        }
        if total > 0.0 {
            Rgb(acc.map(|v| (v / total).round().clamp(0.0, 255.0) as u8))
        } else {
            *out.get_pixel(x, y)
        }
    }
}

fn neighbours(width: u32, height: u32, x: u32, y: u32) -> impl Iterator<Item = (u32, u32)> {
    (-1i64..=1)
        .flat_map(|dy| (-1i64..=1).map(move |dx| (dx, dy)))
        .filter(|&d| d != (0, 0))
        .filter_map(move |(dx, dy)| {
            let nx = x as i64 + dx;
            let ny = y as i64 + dy;
            (nx >= 0 && ny >= 0 && nx < width as i64 && ny < height as i64)
                .then_some((nx as u32, ny as u32))
        })
}

fn has_known_neighbour(known: &[bool], width: u32, height: u32, x: u32, y: u32) -> bool {
    neighbours(width, height, x, y).any(|(nx, ny)| known[(ny * width + nx) as usize])
}

/// Paints every region with the mean colour of the ring just outside the
/// dilated mask, or white when there is no such ring.
#[derive(Debug, Clone, Copy, Default)]
pub struct MeanFillInpainter;

impl MeanFillInpainter {
    fn fill(&self, image: &RgbImage, regions: &[BBoxPx]) -> RgbImage {
        let (width, height) = image.dimensions();
        let mask = build_mask(width, height, regions);
        let dilated = dilate(&mask, Norm::LInf, 2);

        let mut sum = [0u64; 3];
        let mut count = 0u64;
        for (x, y, grown) in dilated.enumerate_pixels() {
            if grown.0[0] != 0 && mask.get_pixel(x, y).0[0] == 0 {
                let px = image.get_pixel(x, y).0;
                for c in 0..3 {
                    sum[c] += px[c] as u64;
                }
                count += 1;
            }
        }
        let fill = if count == 0 {
            Rgb([255, 255, 255])
        } else {
            Rgb(sum.map(|v| (v / count) as u8))
        };

        let mut out = image.clone();
        for (x, y, m) in mask.enumerate_pixels() {
            if m.0[0] != 0 {
                out.put_pixel(x, y, fill);
            }
        }
        out
    }
}

impl Inpainter for MeanFillInpainter {
    fn clean(&self, image: &RgbImage, regions: &[BBoxPx]) -> Result<RgbImage> {
        Ok(self.fill(image, regions))
    }
}
