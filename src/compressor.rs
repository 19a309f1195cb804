// ─── Upload compression pipeline ────────────────────────────────────────────
//
// Shrinks an uploaded image before it is sent to a backend:
// eligibility gate → memory budget → dimension cap → target format →
// encode + accept/reject → fallback ladder. Never fails: every problem turns
// into an uncompressed outcome with a typed reason, and any intermediate
// artifact that is not returned is deleted before returning.

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, ImageReader, Limits, RgbImage};
use serde::Serialize;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::providers::ProviderType;
use crate::settings::CompressionSettings;

/// Estimated peak bytes per decoded pixel (RGBA8 source + resize buffers)
const BYTES_PER_PIXEL: f64 = 6.0;
/// Headroom on top of the raw estimate
const SAFETY_FACTOR: f64 = 2.0;
/// Candidate must be at least this much smaller than the original (percent)
const MIN_SAVINGS_PERCENT: u64 = 2;
const MB: u64 = 1024 * 1024;
/// Longest edge a memory-constrained resize may shrink an image to
const MIN_OUTPUT_EDGE: u32 = 320;
/// Soft ceilings tried, in order, when the budget is too small
const MEMORY_LADDER: [u64; 3] = [256 * MB, 512 * MB, 1024 * MB];

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "bmp", "tif", "tiff"];

/// Why an upload went out uncompressed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    Disabled,
    NotAnImage,
    BelowThreshold(u64),
    /// GIFs may be animated; re-encoding would drop frames
    Animated,
    UnsupportedFormat(String),
    DecodeFailed(String),
    EncodeFailed(String),
    /// The memory budget only allows a uselessly small output
    InsufficientMemory { budget: u64, longest_edge: u32 },
    /// No candidate beat the original by the required margin
    NotSmaller,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Disabled => write!(f, "compression disabled"),
            SkipReason::NotAnImage => write!(f, "not an image"),
            SkipReason::BelowThreshold(size) => write!(f, "file too small ({} bytes)", size),
            SkipReason::Animated => write!(f, "GIF is never re-encoded"),
            SkipReason::UnsupportedFormat(fmt_name) => write!(f, "unsupported format: {}", fmt_name),
            SkipReason::DecodeFailed(e) => write!(f, "decode failed: {}", e),
            SkipReason::EncodeFailed(e) => write!(f, "encode failed: {}", e),
            SkipReason::InsufficientMemory { budget, longest_edge } => write!(
                f,
                "memory budget of {} bytes only fits a {}px output",
                budget, longest_edge
            ),
            SkipReason::NotSmaller => write!(f, "re-encoded image was not smaller"),
        }
    }
}

/// Result of running the pipeline on one file.
///
/// When `compressed` is false, `output_path` is the input path.
#[derive(Debug, Clone, Serialize)]
pub struct CompressionOutcome {
    pub output_path: PathBuf,
    pub compressed: bool,
    /// Extension of the produced artifact ("webp", "jpg", ...)
    pub format: Option<String>,
    pub reason: Option<SkipReason>,
    pub original_size: u64,
    pub output_size: u64,
}

impl CompressionOutcome {
    fn skipped(input: &Path, original_size: u64, reason: SkipReason) -> Self {
        Self {
            output_path: input.to_path_buf(),
            compressed: false,
            format: None,
            reason: Some(reason),
            original_size,
            output_size: original_size,
        }
    }
}

/// Encoders the pipeline can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetFormat {
    /// Modern format that keeps alpha
    WebP,
    /// 3-channel lossy, flattened onto white
    Jpeg,
    Png,
}

impl TargetFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            TargetFormat::WebP => "webp",
            TargetFormat::Jpeg => "jpg",
            TargetFormat::Png => "png",
        }
    }

    /// Primary target for a destination
    pub fn for_destination(provider: ProviderType) -> Self {
        if provider.is_image_host() {
            TargetFormat::Jpeg
        } else {
            TargetFormat::WebP
        }
    }

    /// Same-format fallback for a decoded source
    fn same_as(source: ImageFormat) -> Option<Self> {
        match source {
            ImageFormat::Jpeg => Some(TargetFormat::Jpeg),
            ImageFormat::Png => Some(TargetFormat::Png),
            ImageFormat::WebP => Some(TargetFormat::WebP),
            _ => None,
        }
    }
}

/// Source of the process memory ceiling and current usage
pub trait MemoryProbe: Send {
    fn limit(&self) -> u64;
    fn usage(&self) -> u64;
    /// Try to raise the ceiling to `target`; true on success
    fn try_raise(&mut self, target: u64) -> bool;
}

/// Self-imposed ceiling for this process, raisable up to a hard cap
#[derive(Debug, Clone)]
pub struct ProcessMemory {
    limit: u64,
    hard_cap: u64,
}

impl ProcessMemory {
    pub fn from_settings(settings: &CompressionSettings) -> Self {
        Self {
            limit: settings.memory_limit_mb * MB,
            hard_cap: settings.memory_hard_cap_mb.max(settings.memory_limit_mb) * MB,
        }
    }
}

impl MemoryProbe for ProcessMemory {
    fn limit(&self) -> u64 {
        self.limit
    }

    /// Resident set size, read from procfs where available
    fn usage(&self) -> u64 {
        std::fs::read_to_string("/proc/self/status")
            .ok()
            .and_then(|status| rss_from_status(&status))
            .unwrap_or(0)
    }

    fn try_raise(&mut self, target: u64) -> bool {
        if target <= self.hard_cap {
            self.limit = self.limit.max(target);
            true
        } else {
            false
        }
    }
}

/// `VmRSS` of a `/proc/<pid>/status` document, in bytes (the kernel reports kB)
pub fn rss_from_status(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb = line.trim_start_matches("VmRSS:").split_whitespace().next()?.parse::<u64>().ok()?;
    Some(kb * 1024)
}

/// Pipeline tuning for one upload
#[derive(Debug, Clone)]
pub struct CompressionOptions {
    pub enabled: bool,
    pub quality: u8,
    pub max_dimension: u32,
    pub min_bytes: u64,
    pub target: TargetFormat,
}

impl CompressionOptions {
    pub fn for_destination(settings: &CompressionSettings, provider: ProviderType) -> Self {
        Self {
            enabled: settings.enabled,
            quality: settings.quality.clamp(1, 100),
            max_dimension: settings.max_dimension.max(1),
            min_bytes: settings.min_bytes,
            target: TargetFormat::for_destination(provider),
        }
    }
}

/// Scale plan for a decode of `width`×`height`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalePlan {
    pub budget: u64,
    pub dimension_scale: f64,
    pub memory_scale: f64,
    /// min(dimension, memory, 1.0)
    pub scale: f64,
}

impl ScalePlan {
    pub fn output_size(&self, width: u32, height: u32) -> (u32, u32) {
        if self.scale >= 1.0 {
            return (width, height);
        }
        let w = ((width as f64) * self.scale).round().max(1.0) as u32;
        let h = ((height as f64) * self.scale).round().max(1.0) as u32;
        (w.min(width), h.min(height))
    }

    /// True when memory, not the dimension cap, would shrink the image below
    /// `MIN_OUTPUT_EDGE` (or below its own size, for smaller sources).
    pub fn is_starved(&self, width: u32, height: u32) -> bool {
        if self.memory_scale >= self.dimension_scale {
            return false;
        }
        let (w, h) = self.output_size(width, height);
        w.max(h) < MIN_OUTPUT_EDGE.min(width.max(height))
    }
}

/// Peak decode cost estimate in bytes
pub fn estimate_decode_cost(width: u32, height: u32) -> u64 {
    (width as f64 * height as f64 * BYTES_PER_PIXEL * SAFETY_FACTOR) as u64
}

/// Work out the memory budget (raising the ceiling if needed) and the final scale.
pub fn plan_scale<M: MemoryProbe + ?Sized>(memory: &mut M, width: u32, height: u32, max_dimension: u32) -> ScalePlan {
    let needed = estimate_decode_cost(width, height);
    let usage = memory.usage();
    let mut budget = memory.limit().saturating_sub(usage);

    if needed > budget {
        for target in MEMORY_LADDER {
            if target <= memory.limit() {
                continue;
            }
            if memory.try_raise(target) {
                budget = memory.limit().saturating_sub(usage);
                debug!("Raised memory ceiling to {} MB", target / MB);
                if needed <= budget {
                    break;
                }
            }
        }
        if needed > budget {
            warn!(
                "Image needs ~{} MB, only {} MB available; continuing with reduced budget",
                needed / MB,
                budget / MB
            );
        }
    }

    let longer = width.max(height).max(1) as f64;
    let dimension_scale = (max_dimension as f64 / longer).min(1.0);

    let pixels = (width as f64 * height as f64).max(1.0);
    let affordable_pixels = budget as f64 / (BYTES_PER_PIXEL * SAFETY_FACTOR);
    let memory_scale = (affordable_pixels / pixels).sqrt().min(1.0);

    ScalePlan {
        budget,
        dimension_scale,
        memory_scale,
        scale: dimension_scale.min(memory_scale).min(1.0),
    }
}

/// True when `candidate` is smaller than `original` by the required margin
pub fn accepts(original: u64, candidate: u64) -> bool {
    candidate * 100 <= original * (100 - MIN_SAVINGS_PERCENT)
}

/// Composite onto white and drop alpha
pub fn flatten_onto_white(img: &DynamicImage) -> RgbImage {
    let rgba = img.to_rgba8();
    let (w, h) = rgba.dimensions();
    RgbImage::from_fn(w, h, |x, y| {
        let p = rgba.get_pixel(x, y).0;
        let a = p[3] as u32;
        let blend = |c: u8| ((c as u32 * a + 255 * (255 - a) + 127) / 255) as u8;
        image::Rgb([blend(p[0]), blend(p[1]), blend(p[2])])
    })
}

fn sibling_path(input: &Path, ext: &str) -> PathBuf {
    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("upload");
    let tag = uuid::Uuid::new_v4().simple().to_string();
    input.with_file_name(format!("{}.mdk-{}.{}", stem, &tag[..12], ext))
}

/// Lossy WebP at `quality`, keeping alpha when the source has it
fn encode_webp(img: &DynamicImage, quality: u8) -> Result<webp::WebPMemory, String> {
    let (width, height) = (img.width(), img.height());
    let encoded = if img.color().has_alpha() {
        let rgba = img.to_rgba8();
        webp::Encoder::from_rgba(rgba.as_raw(), width, height).encode_simple(false, quality as f32)
    } else {
        let rgb = img.to_rgb8();
        webp::Encoder::from_rgb(rgb.as_raw(), width, height).encode_simple(false, quality as f32)
    };
    encoded.map_err(|e| format!("Failed to encode WebP: {e:?}"))
}

fn encode(img: &DynamicImage, target: TargetFormat, quality: u8, path: &Path) -> Result<u64, String> {
    let file = File::create(path).map_err(|e| format!("Failed to create output file: {e}"))?;
    let mut writer = BufWriter::new(file);

    match target {
        TargetFormat::Jpeg => {
            let rgb = flatten_onto_white(img);
            let encoder = JpegEncoder::new_with_quality(&mut writer, quality);
            rgb.write_with_encoder(encoder)
                .map_err(|e| format!("Failed to encode JPEG: {e}"))?;
        }
        TargetFormat::WebP => {
            let encoded = encode_webp(img, quality)?;
            writer
                .write_all(&encoded)
                .map_err(|e| format!("Failed to write WebP: {e}"))?;
        }
        TargetFormat::Png => {
            let encoder = PngEncoder::new_with_quality(&mut writer, CompressionType::Best, PngFilter::Adaptive);
            img.write_with_encoder(encoder)
                .map_err(|e| format!("Failed to encode PNG: {e}"))?;
        }
    }
    writer.flush().map_err(|e| format!("Failed to write output: {e}"))?;
    drop(writer);

    let meta = std::fs::metadata(path).map_err(|e| format!("Failed to read output: {e}"))?;
    Ok(meta.len())
}

fn remove_quietly(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove intermediate {}: {}", path.display(), e);
        }
    }
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension().and_then(|e| e.to_str()).map(|e| e.to_lowercase())
}

pub struct Compressor<M: MemoryProbe> {
    options: CompressionOptions,
    memory: M,
}

impl Compressor<ProcessMemory> {
    pub fn new(settings: &CompressionSettings, provider: ProviderType) -> Self {
        Self {
            options: CompressionOptions::for_destination(settings, provider),
            memory: ProcessMemory::from_settings(settings),
        }
    }
}

impl<M: MemoryProbe> Compressor<M> {
    pub fn with_memory(options: CompressionOptions, memory: M) -> Self {
        Self { options, memory }
    }

    /// Run the pipeline synchronously. CPU-bound; call from a blocking thread.
    pub fn compress(&mut self, input: &Path) -> CompressionOutcome {
        let name = input.file_name().and_then(|n| n.to_str()).unwrap_or_default().to_string();
        self.compress_named(input, &name)
    }

    /// Like `compress`, judging eligibility by `name` instead of the input path.
    ///
    /// Upload temp files usually carry no extension of their own.
    pub fn compress_named(&mut self, input: &Path, name: &str) -> CompressionOutcome {
        let original_size = match std::fs::metadata(input) {
            Ok(meta) => meta.len(),
            Err(e) => return CompressionOutcome::skipped(input, 0, SkipReason::DecodeFailed(e.to_string())),
        };

        if !self.options.enabled {
            return CompressionOutcome::skipped(input, original_size, SkipReason::Disabled);
        }

        let ext = extension_of(Path::new(name)).unwrap_or_default();
        if !IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            return CompressionOutcome::skipped(input, original_size, SkipReason::NotAnImage);
        }
        if original_size < self.options.min_bytes {
            return CompressionOutcome::skipped(input, original_size, SkipReason::BelowThreshold(original_size));
        }
        if ext == "gif" {
            return CompressionOutcome::skipped(input, original_size, SkipReason::Animated);
        }

        let (source_format, (width, height)) = match probe(input) {
            Ok(found) => found,
            Err(reason) => return CompressionOutcome::skipped(input, original_size, reason),
        };
        if source_format == ImageFormat::Gif {
            return CompressionOutcome::skipped(input, original_size, SkipReason::Animated);
        }

        let plan = plan_scale(&mut self.memory, width, height, self.options.max_dimension);
        if plan.is_starved(width, height) {
            let (w, h) = plan.output_size(width, height);
            warn!("Not compressing {}: memory budget too small", input.display());
            return CompressionOutcome::skipped(
                input,
                original_size,
                SkipReason::InsufficientMemory { budget: plan.budget, longest_edge: w.max(h) },
            );
        }
        let img = match decode(input, plan.budget.max(estimate_decode_cost(width, height))) {
            Ok(img) => img,
            Err(reason) => return CompressionOutcome::skipped(input, original_size, reason),
        };
        let (out_w, out_h) = plan.output_size(width, height);
        let img = if (out_w, out_h) != (width, height) {
            debug!("Resizing {}x{} -> {}x{}", width, height, out_w, out_h);
            img.resize_exact(out_w, out_h, FilterType::Lanczos3)
        } else {
            img
        };

        let mut ladder = vec![self.options.target];
        if let Some(same) = TargetFormat::same_as(source_format) {
            if same != self.options.target {
                ladder.push(same);
            }
        }

        let mut last_reason = SkipReason::NotSmaller;
        for target in ladder {
            let candidate = sibling_path(input, target.extension());
            match encode(&img, target, self.options.quality, &candidate) {
                Ok(size) if accepts(original_size, size) => {
                    info!(
                        "Compressed {} ({} -> {} bytes, {})",
                        input.display(),
                        original_size,
                        size,
                        target.extension()
                    );
                    return CompressionOutcome {
                        output_path: candidate,
                        compressed: true,
                        format: Some(target.extension().to_string()),
                        reason: None,
                        original_size,
                        output_size: size,
                    };
                }
                Ok(size) => {
                    debug!("{} candidate {} bytes not smaller than {}", target.extension(), size, original_size);
                    remove_quietly(&candidate);
                    last_reason = SkipReason::NotSmaller;
                }
                Err(e) => {
                    warn!("Compression attempt failed: {}", e);
                    remove_quietly(&candidate);
                    last_reason = SkipReason::EncodeFailed(e);
                }
            }
        }

        CompressionOutcome::skipped(input, original_size, last_reason)
    }
}

fn probe(input: &Path) -> Result<(ImageFormat, (u32, u32)), SkipReason> {
    let reader = ImageReader::open(input)
        .map_err(|e| SkipReason::DecodeFailed(e.to_string()))?
        .with_guessed_format()
        .map_err(|e| SkipReason::DecodeFailed(e.to_string()))?;
    let format = reader
        .format()
        .ok_or_else(|| SkipReason::UnsupportedFormat("unknown".to_string()))?;
    let dims = reader
        .into_dimensions()
        .map_err(|e| SkipReason::UnsupportedFormat(e.to_string()))?;
    Ok((format, dims))
}

fn decode(input: &Path, max_alloc: u64) -> Result<DynamicImage, SkipReason> {
    let mut reader = ImageReader::open(input)
        .map_err(|e| SkipReason::DecodeFailed(e.to_string()))?
        .with_guessed_format()
        .map_err(|e| SkipReason::DecodeFailed(e.to_string()))?;
    let mut limits = Limits::default();
    limits.max_alloc = Some(max_alloc);
    reader.limits(limits);
    reader.decode().map_err(|e| SkipReason::DecodeFailed(e.to_string()))
}

/// Run the pipeline for an upload to `provider` on a blocking thread.
pub async fn compress_for_upload(
    settings: &CompressionSettings,
    provider: ProviderType,
    input: &Path,
    name: &str,
) -> CompressionOutcome {
    let mut compressor = Compressor::new(settings, provider);
    let path = input.to_path_buf();
    let name = name.to_string();
    match tokio::task::spawn_blocking(move || compressor.compress_named(&path, &name)).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!("Compression thread failed: {}", e);
            let size = std::fs::metadata(input).map(|m| m.len()).unwrap_or(0);
            CompressionOutcome::skipped(input, size, SkipReason::EncodeFailed(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb, Rgba};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    struct FixedMemory {
        limit: u64,
        usage: u64,
        hard_cap: u64,
        raises: Vec<u64>,
    }

    impl MemoryProbe for FixedMemory {
        fn limit(&self) -> u64 {
            self.limit
        }
        fn usage(&self) -> u64 {
            self.usage
        }
        fn try_raise(&mut self, target: u64) -> bool {
            self.raises.push(target);
            if target <= self.hard_cap {
                self.limit = target;
                true
            } else {
                false
            }
        }
    }

    fn roomy() -> FixedMemory {
        FixedMemory { limit: 2048 * MB, usage: 0, hard_cap: 2048 * MB, raises: vec![] }
    }

    fn options(target: TargetFormat) -> CompressionOptions {
        CompressionOptions {
            enabled: true,
            quality: 80,
            max_dimension: 1080,
            min_bytes: 50 * 1024,
            target,
        }
    }

    fn write_gradient_jpeg(path: &Path, width: u32, height: u32) {
        let img: RgbImage = ImageBuffer::from_fn(width, height, |x, y| {
            Rgb([(x * 255 / width) as u8, (y * 255 / height) as u8, ((x + y) % 256) as u8])
        });
        let writer = BufWriter::new(File::create(path).unwrap());
        img.write_with_encoder(JpegEncoder::new_with_quality(writer, 100)).unwrap();
    }

    /// Gradient with seeded grain, closer to a camera photo than a flat gradient
    fn write_photo_jpeg(path: &Path, width: u32, height: u32) {
        let mut rng = StdRng::seed_from_u64(7);
        let img: RgbImage = ImageBuffer::from_fn(width, height, |x, y| {
            let grain: i16 = rng.gen_range(-12..=12);
            let shade = |base: u32| (base as i16 + grain).clamp(0, 255) as u8;
            Rgb([shade(x * 255 / width), shade(y * 255 / height), shade((x / 3 + y / 5) % 256)])
        });
        let writer = BufWriter::new(File::create(path).unwrap());
        img.write_with_encoder(JpegEncoder::new_with_quality(writer, 95)).unwrap();
    }

    fn write_noise_png(path: &Path, width: u32, height: u32) {
        let mut rng = StdRng::seed_from_u64(42);
        let img: RgbImage = ImageBuffer::from_fn(width, height, |_, _| Rgb([rng.gen(), rng.gen(), rng.gen()]));
        let writer = BufWriter::new(File::create(path).unwrap());
        img.write_with_encoder(PngEncoder::new_with_quality(writer, CompressionType::Best, PngFilter::Adaptive))
            .unwrap();
    }

    fn files_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_accepts_requires_two_percent() {
        assert!(accepts(1000, 980));
        assert!(!accepts(1000, 981));
        assert!(!accepts(1000, 1000));
        assert!(!accepts(1000, 1200));
    }

    #[test]
    fn test_plan_never_upscales() {
        let plan = plan_scale(&mut roomy(), 800, 600, 1080);
        assert_eq!(plan.scale, 1.0);
        assert_eq!(plan.output_size(800, 600), (800, 600));
    }

    #[test]
    fn test_plan_caps_longer_edge() {
        let plan = plan_scale(&mut roomy(), 3000, 2000, 1080);
        assert_eq!(plan.output_size(3000, 2000), (1080, 720));
        let portrait = plan_scale(&mut roomy(), 2000, 4000, 1080);
        assert_eq!(portrait.output_size(2000, 4000), (540, 1080));
    }

    #[test]
    fn test_plan_raises_ceiling_through_ladder() {
        let mut memory = FixedMemory { limit: 16 * MB, usage: 0, hard_cap: 512 * MB, raises: vec![] };
        // 3000x2000 needs ~69 MB
        let plan = plan_scale(&mut memory, 3000, 2000, 1080);
        assert_eq!(memory.raises, vec![256 * MB]);
        assert_eq!(plan.budget, 256 * MB);
        assert_eq!(plan.scale, plan.dimension_scale);
    }

    #[test]
    fn test_plan_proceeds_with_reduced_budget() {
        let mut memory = FixedMemory { limit: 4 * MB, usage: 0, hard_cap: 4 * MB, raises: vec![] };
        let plan = plan_scale(&mut memory, 3000, 2000, 1080);
        assert_eq!(memory.raises, vec![256 * MB, 512 * MB, 1024 * MB]);
        assert_eq!(plan.budget, 4 * MB);
        assert!(plan.memory_scale < plan.dimension_scale);
        assert_eq!(plan.scale, plan.memory_scale);
        let (w, h) = plan.output_size(3000, 2000);
        assert!(w < 1080 && h < 720);
        assert!(estimate_decode_cost(w, h) <= 4 * MB + 4 * MB / 100);
    }

    #[test]
    fn test_usage_is_subtracted_from_limit() {
        let mut memory = FixedMemory { limit: 300 * MB, usage: 100 * MB, hard_cap: 300 * MB, raises: vec![] };
        let plan = plan_scale(&mut memory, 100, 100, 1080);
        assert_eq!(plan.budget, 200 * MB);
        assert!(memory.raises.is_empty());
    }

    #[test]
    fn test_plan_with_exhausted_memory_is_starved() {
        let mut memory = FixedMemory { limit: 128 * MB, usage: 600 * MB, hard_cap: 512 * MB, raises: vec![] };
        let plan = plan_scale(&mut memory, 3000, 2000, 1080);
        assert_eq!(plan.budget, 0);
        assert!(plan.is_starved(3000, 2000));

        // Sources that fit in memory are never starved, however small
        let plan = plan_scale(&mut roomy(), 200, 100, 1080);
        assert!(!plan.is_starved(200, 100));
    }

    #[test]
    fn test_exhausted_memory_keeps_original() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("photo.jpg");
        write_gradient_jpeg(&input, 3000, 2000);
        let before = files_in(dir.path());

        let memory = FixedMemory { limit: 128 * MB, usage: 600 * MB, hard_cap: 512 * MB, raises: vec![] };
        let outcome = Compressor::with_memory(options(TargetFormat::WebP), memory).compress(&input);
        assert!(!outcome.compressed);
        assert_eq!(outcome.output_path, input);
        assert_eq!(outcome.output_size, outcome.original_size);
        assert!(matches!(outcome.reason, Some(SkipReason::InsufficientMemory { budget: 0, .. })));
        assert_eq!(files_in(dir.path()), before);
        assert_eq!(image::image_dimensions(&input).unwrap(), (3000, 2000));
    }

    #[test]
    fn test_webp_output_follows_quality() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("photo.jpg");
        write_photo_jpeg(&input, 1500, 1000);

        let mut sizes = Vec::new();
        for quality in [30, 90] {
            let mut opts = options(TargetFormat::WebP);
            opts.quality = quality;
            let outcome = Compressor::with_memory(opts, roomy()).compress(&input);
            assert!(outcome.compressed, "q{}: {:?}", quality, outcome.reason);
            assert_eq!(outcome.format.as_deref(), Some("webp"));
            assert_eq!(ImageFormat::from_path(&outcome.output_path).unwrap(), ImageFormat::WebP);
            let decoded = image::open(&outcome.output_path).unwrap();
            assert_eq!((decoded.width(), decoded.height()), (1080, 720));
            sizes.push(outcome.output_size);
        }
        assert!(sizes[0] < sizes[1], "sizes: {:?}", sizes);
    }

    #[test]
    fn test_rss_from_status() {
        let status = "Name:\tmediadock\nVmPeak:\t  20000 kB\nVmRSS:\t   5120 kB\nThreads:\t4\n";
        assert_eq!(rss_from_status(status), Some(5120 * 1024));
        assert_eq!(rss_from_status("Name:\tx\n"), None);
    }

    #[test]
    fn test_large_jpeg_to_object_storage_becomes_webp() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("photo.jpg");
        write_gradient_jpeg(&input, 3000, 2000);

        let outcome = Compressor::with_memory(options(TargetFormat::WebP), roomy()).compress(&input);
        assert!(outcome.compressed, "reason: {:?}", outcome.reason);
        assert_eq!(outcome.format.as_deref(), Some("webp"));
        assert_ne!(outcome.output_path, input);
        assert!(outcome.output_size < outcome.original_size);

        let (w, h) = image::image_dimensions(&outcome.output_path).unwrap();
        assert_eq!(w.max(h), 1080);
        assert_eq!(ImageFormat::from_path(&outcome.output_path).unwrap(), ImageFormat::WebP);
    }

    #[test]
    fn test_large_jpeg_to_image_host_becomes_jpeg() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("photo.jpg");
        write_gradient_jpeg(&input, 3000, 2000);

        let outcome = Compressor::with_memory(options(TargetFormat::Jpeg), roomy()).compress(&input);
        assert!(outcome.compressed, "reason: {:?}", outcome.reason);
        assert_eq!(outcome.format.as_deref(), Some("jpg"));
        let decoded = image::open(&outcome.output_path).unwrap();
        assert!(!decoded.color().has_alpha());
        assert!(decoded.width().max(decoded.height()) <= 1080);
    }

    #[test]
    fn test_flatten_uses_white_background() {
        let img = DynamicImage::ImageRgba8(ImageBuffer::from_fn(2, 1, |x, _| {
            if x == 0 { Rgba([0, 0, 0, 0]) } else { Rgba([10, 20, 30, 255]) }
        }));
        let flat = flatten_onto_white(&img);
        assert_eq!(flat.get_pixel(0, 0).0, [255, 255, 255]);
        assert_eq!(flat.get_pixel(1, 0).0, [10, 20, 30]);
    }

    #[test]
    fn test_small_image_keeps_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("noise.png");
        write_noise_png(&input, 800, 600);

        let outcome = Compressor::with_memory(options(TargetFormat::WebP), roomy()).compress(&input);
        let (w, h) = image::image_dimensions(&outcome.output_path).unwrap();
        assert_eq!((w, h), (800, 600));
    }

    #[test]
    fn test_incompressible_returns_original_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("noise.png");
        write_noise_png(&input, 200, 200);
        let before = files_in(dir.path());

        let outcome = Compressor::with_memory(options(TargetFormat::WebP), roomy()).compress(&input);
        assert!(!outcome.compressed);
        assert_eq!(outcome.output_path, input);
        assert_eq!(outcome.reason, Some(SkipReason::NotSmaller));
        assert_eq!(files_in(dir.path()), before);
    }

    #[test]
    fn test_gif_is_never_reencoded() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("anim.gif");
        std::fs::write(&input, vec![0u8; 80 * 1024]).unwrap();
        let outcome = Compressor::with_memory(options(TargetFormat::WebP), roomy()).compress(&input);
        assert_eq!(outcome.reason, Some(SkipReason::Animated));
        assert_eq!(outcome.output_path, input);
    }

    #[test]
    fn test_gates() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = dir.path().join("doc.pdf");
        std::fs::write(&pdf, vec![1u8; 100 * 1024]).unwrap();
        let small = dir.path().join("tiny.jpg");
        std::fs::write(&small, vec![1u8; 1024]).unwrap();

        let mut compressor = Compressor::with_memory(options(TargetFormat::WebP), roomy());
        assert_eq!(compressor.compress(&pdf).reason, Some(SkipReason::NotAnImage));
        assert_eq!(compressor.compress(&small).reason, Some(SkipReason::BelowThreshold(1024)));

        let mut disabled = options(TargetFormat::WebP);
        disabled.enabled = false;
        assert_eq!(Compressor::with_memory(disabled, roomy()).compress(&small).reason, Some(SkipReason::Disabled));
    }

    #[test]
    fn test_corrupt_image_skips_with_reason() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("broken.jpg");
        std::fs::write(&input, vec![7u8; 64 * 1024]).unwrap();
        let outcome = Compressor::with_memory(options(TargetFormat::WebP), roomy()).compress(&input);
        assert!(!outcome.compressed);
        assert_eq!(outcome.output_path, input);
        assert!(matches!(
            outcome.reason,
            Some(SkipReason::UnsupportedFormat(_)) | Some(SkipReason::DecodeFailed(_))
        ));
        assert_eq!(files_in(dir.path()), vec!["broken.jpg".to_string()]);
    }

    #[tokio::test]
    async fn test_compress_for_upload_runs_off_thread() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("photo.jpg");
        write_gradient_jpeg(&input, 3000, 2000);
        let outcome = compress_for_upload(&CompressionSettings::default(), ProviderType::Cos, &input, "photo.jpg").await;
        assert!(outcome.compressed);
        assert_eq!(outcome.format.as_deref(), Some("webp"));
    }

    #[test]
    fn test_eligibility_uses_given_name() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("phpX9y8Z7");
        write_gradient_jpeg(&input, 1600, 1200);
        let mut compressor = Compressor::with_memory(options(TargetFormat::Jpeg), roomy());
        assert_eq!(compressor.compress(&input).reason, Some(SkipReason::NotAnImage));
        let outcome = compressor.compress_named(&input, "holiday.jpg");
        assert!(outcome.compressed, "reason: {:?}", outcome.reason);
        assert!(outcome.output_path.starts_with(dir.path()));
    }
}
