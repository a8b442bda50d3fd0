//! Interactive corner calibration
//!
//! The session moves through three phases:
//! collecting corners (clicks from the web UI), ready (four corners picked,
//! table not built yet) and running (the apply loop owns a bound table).
//! A reset from any phase returns to collecting.

use anyhow::Result;
use imageproc::drawing::{draw_filled_circle_mut, draw_line_segment_mut};
use image::Rgb;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::apply::{Method, Remapper};
use crate::bench::FrameSink;
use crate::canvas::{Canvas, SourceFrame};
use crate::config::{CornerSet, Point, Resolution};
use crate::remap::RemapTable;
use crate::server::AppState;

/// Labels for the corners, in picking order
pub const CORNER_LABELS: [&str; 4] = ["Top Left", "Top Right", "Bottom Right", "Bottom Left"];

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SessionError {
    #[error("all four corners are already set; reset to pick again")]
    NotCollecting,

    #[error("point ({x}, {y}) is outside the {resolution} frame")]
    OutsideFrame { x: f64, y: f64, resolution: Resolution },

    #[error("corners are fixed for this run; use the calibrate command to pick them")]
    Fixed,
}

#[derive(Debug, Clone, PartialEq)]
enum SessionState {
    Collecting { points: Vec<Point> },
    Ready { corners: CornerSet },
    Running { corners: CornerSet },
}

/// Phase name reported to the web UI
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Collecting,
    Ready,
    Running,
}

#[derive(Debug, Clone)]
pub struct CalibrationSession {
    resolution: Resolution,
    state: SessionState,
    /// Bumped on every change so observers can tell when to redraw
    revision: u64,
    /// Corners came from the command line and cannot be picked again
    fixed: bool,
}

impl CalibrationSession {
    pub fn new(resolution: Resolution) -> Self {
        Self {
            resolution,
            state: SessionState::Collecting { points: Vec::new() },
            revision: 0,
            fixed: false,
        }
    }

    /// Start with known corners, skipping the picking phase
    pub fn with_corners(resolution: Resolution, corners: CornerSet) -> Self {
        Self {
            resolution,
            state: SessionState::Ready { corners },
            revision: 0,
            fixed: false,
        }
    }

    /// Corners already in use by a benchmark; picking and reset are refused
    pub fn fixed(resolution: Resolution, corners: CornerSet) -> Self {
        Self {
            resolution,
            state: SessionState::Running { corners },
            revision: 0,
            fixed: true,
        }
    }

    pub fn is_fixed(&self) -> bool {
        self.fixed
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn phase(&self) -> Phase {
        match self.state {
            SessionState::Collecting { .. } => Phase::Collecting,
            SessionState::Ready { .. } => Phase::Ready,
            SessionState::Running { .. } => Phase::Running,
        }
    }

    /// Points picked so far, or the full corner set once complete
    pub fn points(&self) -> Vec<Point> {
        match &self.state {
            SessionState::Collecting { points } => points.clone(),
            SessionState::Ready { corners } | SessionState::Running { corners } => {
                corners.points().to_vec()
            }
        }
    }

    pub fn corners(&self) -> Option<CornerSet> {
        match &self.state {
            SessionState::Collecting { .. } => None,
            SessionState::Ready { corners } | SessionState::Running { corners } => Some(*corners),
        }
    }

    /// Record the next corner; the fourth one moves the session to ready
    pub fn add_point(&mut self, point: Point) -> Result<Phase, SessionError> {
        if self.fixed {
            return Err(SessionError::Fixed);
        }
        if !point.is_within(self.resolution) {
            return Err(SessionError::OutsideFrame {
                x: point.x,
                y: point.y,
                resolution: self.resolution,
            });
        }

        let SessionState::Collecting { points } = &mut self.state else {
            return Err(SessionError::NotCollecting);
        };

        points.push(point);
        debug!("{} set to {}", CORNER_LABELS[points.len() - 1], point);

        if points.len() == 4 {
            let corners = CornerSet::from_points([points[0], points[1], points[2], points[3]]);
            info!("Corners picked: {}", corners);
            self.state = SessionState::Ready { corners };
        }

        self.revision += 1;
        Ok(self.phase())
    }

    /// Hand the corners to the apply loop, moving ready to running
    pub fn take_ready(&mut self) -> Option<CornerSet> {
        match self.state {
            SessionState::Ready { corners } => {
                self.state = SessionState::Running { corners };
                self.revision += 1;
                Some(corners)
            }
            _ => None,
        }
    }

    /// Discard all corners and start picking again
    pub fn reset(&mut self) -> Result<(), SessionError> {
        if self.fixed {
            return Err(SessionError::Fixed);
        }
        self.state = SessionState::Collecting { points: Vec::new() };
        self.revision += 1;
        Ok(())
    }
}

/// Draw picked corners and the quadrilateral outline onto the source frame
pub fn draw_corners(source: &SourceFrame, points: &[Point]) -> image::RgbImage {
    let mut image = source.to_rgb_image();
    let marker = Rgb([255u8, 255, 255]);
    let outline = Rgb([255u8, 64, 64]);

    for pair in points.windows(2) {
        draw_line_segment_mut(
            &mut image,
            (pair[0].x as f32, pair[0].y as f32),
            (pair[1].x as f32, pair[1].y as f32),
            outline,
        );
    }
    if points.len() == 4 {
        draw_line_segment_mut(
            &mut image,
            (points[3].x as f32, points[3].y as f32),
            (points[0].x as f32, points[0].y as f32),
            outline,
        );
    }
    for p in points {
        draw_filled_circle_mut(&mut image, (p.x as i32, p.y as i32), 3, marker);
    }

    image
}

/// Drive the calibration session until a stop is requested
///
/// While corners are being collected the annotated source frame is
/// published; once the session is ready the table is built and bound, and
/// every loop iteration applies it and presents the canvas.
pub fn run_calibration(
    state: Arc<AppState>,
    source: SourceFrame,
    method: Method,
    mut sinks: Vec<Box<dyn FrameSink>>,
) -> Result<()> {
    let resolution = source.resolution();
    let canvas = Canvas::new(resolution);
    let mut active: Option<Remapper<'_>> = None;
    let mut drawn_revision = None;
    let mut frame_count = 0u64;
    let mut last_stats = Instant::now();

    info!("Calibration loop started ({}, {})", resolution, method);

    while !state.is_stop_requested() {
        let (ready, phase, revision, points) = {
            let mut session = state.session.lock();
            let ready = session.take_ready();
            (ready, session.phase(), session.revision(), session.points())
        };

        if let Some(corners) = ready {
            let start = Instant::now();
            let bound = RemapTable::from_corners(&corners, resolution)
                .and_then(|table| Remapper::new(method, &table, &canvas));
            match bound {
                Ok(remapper) => {
                    info!(
                        "Remap table ready for {} in {} ms",
                        corners,
                        start.elapsed().as_millis()
                    );
                    canvas.clear();
                    active = Some(remapper);
                }
                Err(e) => {
                    warn!("Cannot use corners {}: {}", corners, e);
                    if let Err(e) = state.session.lock().reset() {
                        warn!("Cannot return to corner picking: {}", e);
                    }
                    active = None;
                }
            }
        } else if phase == Phase::Collecting && active.is_some() {
            info!("Calibration reset, collecting corners");
            active = None;
        }

        if drawn_revision != Some(revision) {
            state.update_source_preview(&draw_corners(&source, &points));
            drawn_revision = Some(revision);
        }

        match &active {
            Some(remapper) => {
                remapper.apply(source.words());
                for sink in sinks.iter_mut() {
                    if let Err(e) = sink.present(&canvas) {
                        if frame_count % 100 == 0 {
                            warn!("Failed to present frame to {}: {}", sink.name(), e);
                        }
                    }
                }
                frame_count += 1;

                if last_stats.elapsed() >= Duration::from_secs(10) {
                    let elapsed = last_stats.elapsed().as_secs_f64();
                    info!(
                        "Performance: {:.1} fps ({} frames in {:.1}s)",
                        frame_count as f64 / elapsed,
                        frame_count,
                        elapsed
                    );
                    frame_count = 0;
                    last_stats = Instant::now();
                }
            }
            None => std::thread::sleep(Duration::from_millis(50)),
        }
    }

    info!("Calibration loop stopped");
    Ok(())
}
