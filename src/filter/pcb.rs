use image::{GrayImage, Luma};
use imageproc::contours::find_contours;
use imageproc::contrast::otsu_level;
use imageproc::morphology::close;
use imageproc::distance_transform::Norm;
use tokio::sync::watch;

use crate::config::FilterConfig;
use crate::error::FilterError;
use crate::frame::{FrameBuffer, Metadata};
use crate::queue::{FrameReceiver, FrameSender};

use super::{write_training_frame, Filter};

const DEFAULT_TRAINING_DIR: &str = "./frames";
const COOLDOWN_FRAMES: u32 = 7;
const STRIP_WIDTH: u32 = 10;
const CENTER_TOLERANCE: i64 = 100;
/// Approximates the original's 20x20 rectangular morphological close kernel
/// as a radius-10 structuring element under the Chebyshev (L-infinity) norm.
const MORPH_RADIUS: u8 = 10;

/// Per-frame pixel-count thresholds, read from the filter config's free-form
/// params.
struct Thresholds {
    n_total_px: u32,
    n_left_px: u32,
    n_right_px: u32,
}

impl Thresholds {
    fn from_config(config: &FilterConfig) -> Self {
        let get = |key: &str, default: u32| -> u32 {
            config
                .params
                .get(key)
                .and_then(|v| v.as_u64())
                .map(|v| v as u32)
                .unwrap_or(default)
        };
        Self {
            n_total_px: get("n_total_px", 500),
            n_left_px: get("n_left_px", 50),
            n_right_px: get("n_right_px", 50),
        }
    }
}

pub struct PcbFilter {
    input: FrameReceiver,
    output: FrameSender,
    stop_rx: watch::Receiver<bool>,
    training_mode: bool,
    training_dir: String,
    profiling: bool,
    thresholds: Thresholds,
    background: Option<Vec<f32>>,
    locked: bool,
    lock_frame_count: u32,
    training_count: u64,
}

pub fn build(
    config: FilterConfig,
    input: FrameReceiver,
    output: FrameSender,
    stop_rx: watch::Receiver<bool>,
) -> Result<Box<dyn Filter>, FilterError> {
    let thresholds = Thresholds::from_config(&config);
    let training_dir = config
        .params
        .get("training_dir")
        .and_then(|v| v.as_str())
        .unwrap_or(DEFAULT_TRAINING_DIR)
        .to_string();
    Ok(Box::new(PcbFilter {
        input,
        output,
        stop_rx,
        training_mode: config.training_mode,
        training_dir,
        profiling: config.profiling,
        thresholds,
        background: None,
        locked: false,
        lock_frame_count: 0,
        training_count: 0,
    }))
}

#[async_trait::async_trait]
impl Filter for PcbFilter {
    async fn run(mut self: Box<Self>) {
        loop {
            let mut frame = tokio::select! {
                biased;
                _ = self.stop_rx.changed() => {
                    if *self.stop_rx.borrow() {
                        return;
                    }
                    continue;
                }
                frame = self.input.recv() => match frame {
                    Some(frame) => frame,
                    None => return,
                },
            };

            if self.profiling {
                frame
                    .metadata
                    .stamp(crate::frame::KEY_TS_VI_FILTER_ENTRY, crate::frame::now_millis());
            }

            if self.training_mode {
                self.training_count += 1;
                write_training_frame(&self.training_dir, self.training_count, &frame).await;
                continue;
            }

            let anomaly = self.check_frame(&frame.buffer);

            if !self.locked {
                if anomaly {
                    Self::mark_anomaly(&mut frame.metadata);
                    if self.output.send(frame).await.is_err() {
                        return;
                    }
                    self.locked = true;
                    self.lock_frame_count = 0;
                }
            } else {
                self.lock_frame_count += 1;
                if self.lock_frame_count >= COOLDOWN_FRAMES {
                    self.locked = false;
                    self.lock_frame_count = 0;
                }
            }
        }
    }
}

impl PcbFilter {
    fn mark_anomaly(metadata: &mut Metadata) {
        metadata.set(crate::frame::KEY_USER_DATA, 1i64);
    }

    /// Updates the running background model and, unless currently in the
    /// post-emission cool-down, evaluates the PCB anomaly predicate:
    /// enough total foreground pixels, not too many on either edge strip,
    /// and a dominant contour that doesn't touch the frame edges and sits
    /// near the horizontal center.
    fn check_frame(&mut self, buffer: &FrameBuffer) -> bool {
        let Some((height, width, channel)) = buffer.shape else {
            return false;
        };
        let Some(gray) = to_grayscale(&buffer.data, height, width, channel) else {
            return false;
        };

        let diff = self.update_background(&gray, height, width);

        if self.locked {
            return false;
        }

        let threshold = otsu_level(&diff);
        let mut binary = GrayImage::new(width, height);
        for (x, y, px) in diff.enumerate_pixels() {
            let v = if px.0[0] >= threshold { 255 } else { 0 };
            binary.put_pixel(x, y, Luma([v]));
        }
        let closed = close(&binary, Norm::LInf, MORPH_RADIUS);

        let n_total = count_white(&closed, 0, width);
        let n_left = count_white(&closed, 0, STRIP_WIDTH.min(width));
        let right_start = width.saturating_sub(STRIP_WIDTH);
        let n_right = count_white(&closed, right_start, width);

        if !(n_total > self.thresholds.n_total_px
            && n_left < self.thresholds.n_left_px
            && n_right < self.thresholds.n_right_px)
        {
            return false;
        }

        let contours = find_contours::<i32>(&closed);
        let Some(largest) = contours
            .iter()
            .max_by_key(|c| contour_area(c))
        else {
            return false;
        };

        let (min_x, max_x) = match bbox_x_range(largest) {
            Some(range) => range,
            None => return false,
        };

        if min_x <= 0 || max_x >= width as i32 - 1 {
            return false;
        }

        let center_x = (min_x + max_x) / 2;
        let frame_center = width as i64 / 2;
        (center_x as i64 - frame_center).abs() <= CENTER_TOLERANCE
    }

    /// Exponential running-average background subtractor, standing in for
    /// the original's MOG2 model (no direct equivalent in this crate's
    /// dependency stack). Returns the absolute difference image.
    fn update_background(&mut self, gray: &GrayImage, height: u32, width: u32) -> GrayImage {
        const ALPHA: f32 = 0.05;
        let pixel_count = (height * width) as usize;

        let background = self
            .background
            .get_or_insert_with(|| gray.pixels().map(|p| p.0[0] as f32).collect());

        if background.len() != pixel_count {
            *background = gray.pixels().map(|p| p.0[0] as f32).collect();
        }

        let mut diff = GrayImage::new(width, height);
        for (i, (x, y, px)) in gray.enumerate_pixels().enumerate() {
            let value = px.0[0] as f32;
            let d = (value - background[i]).abs().min(255.0) as u8;
            diff.put_pixel(x, y, Luma([d]));
            background[i] = background[i] * (1.0 - ALPHA) + value * ALPHA;
        }
        diff
    }
}

fn to_grayscale(data: &[u8], height: u32, width: u32, channel: u32) -> Option<GrayImage> {
    let mut gray = GrayImage::new(width, height);
    let stride = channel as usize;
    if data.len() < (height * width) as usize * stride {
        return None;
    }
    for y in 0..height {
        for x in 0..width {
            let idx = ((y * width + x) as usize) * stride;
            let value = if stride >= 3 {
                let r = data[idx] as u32;
                let g = data[idx + 1] as u32;
                let b = data[idx + 2] as u32;
                ((r + g + b) / 3) as u8
            } else {
                data[idx]
            };
            gray.put_pixel(x, y, Luma([value]));
        }
    }
    Some(gray)
}

fn count_white(image: &GrayImage, x_start: u32, x_end: u32) -> u32 {
    let mut count = 0;
    for y in 0..image.height() {
        for x in x_start..x_end.min(image.width()) {
            if image.get_pixel(x, y).0[0] > 0 {
                count += 1;
            }
        }
    }
    count
}

fn contour_area(contour: &imageproc::contours::Contour<i32>) -> i64 {
    match bbox_x_range(contour) {
        Some((min_x, max_x)) => (max_x - min_x).max(0) as i64 * contour.points.len() as i64,
        None => 0,
    }
}

fn bbox_x_range(contour: &imageproc::contours::Contour<i32>) -> Option<(i32, i32)> {
    if contour.points.is_empty() {
        return None;
    }
    let mut min_x = i32::MAX;
    let mut max_x = i32::MIN;
    for point in &contour.points {
        min_x = min_x.min(point.x);
        max_x = max_x.max(point.x);
    }
    Some((min_x, max_x))
}
