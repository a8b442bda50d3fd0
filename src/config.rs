//! Configuration management and the geometric input types
//!
//! Corner points and the display resolution arrive either from the command
//! line (`x,y` and `WxH` strings) or from the TOML config file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

use crate::apply::Method;

/// Errors produced while parsing points and resolutions from text
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("expected coordinates in the form x,y but got {0:?}")]
    Point(String),

    #[error("expected a resolution in the form WxH but got {0:?}")]
    Resolution(String),

    #[error("resolution must be at least 1x1, got {0}x{1}")]
    EmptyResolution(u32, u32),
}

/// A 2D point in pixel coordinates
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Whether the point lies on the pixel grid `[0,W) x [0,H)`
    pub fn is_within(&self, resolution: Resolution) -> bool {
        self.x >= 0.0
            && self.y >= 0.0
            && self.x < resolution.width as f64
            && self.y < resolution.height as f64
    }
}

impl FromStr for Point {
    type Err = ParseError;

    /// Parses `x,y` where both parts are non-negative integers
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseError::Point(s.to_string());
        let (x, y) = s.trim().split_once(',').ok_or_else(err)?;
        let x: u32 = x.trim().parse().map_err(|_| err())?;
        let y: u32 = y.trim().parse().map_err(|_| err())?;
        Ok(Self::new(x as f64, y as f64))
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.x, self.y)
    }
}

/// Processing resolution; the canonical grid is `[0,width) x [0,height)`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Number of pixels, which is also the length of every remap table
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Self::new(1920, 1080)
    }
}

impl FromStr for Resolution {
    type Err = ParseError;

    /// Parses `WxH` (the separator may also be an upper-case `X`)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseError::Resolution(s.to_string());
        let (w, h) = s.trim().split_once(['x', 'X']).ok_or_else(err)?;
        let width: u32 = w.parse().map_err(|_| err())?;
        let height: u32 = h.parse().map_err(|_| err())?;
        if width == 0 || height == 0 {
            return Err(ParseError::EmptyResolution(width, height));
        }
        Ok(Self::new(width, height))
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// The destination quadrilateral
/// Order: top-left, top-right, bottom-right, bottom-left
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CornerSet {
    pub top_left: Point,
    pub top_right: Point,
    pub bottom_right: Point,
    pub bottom_left: Point,
}

impl CornerSet {
    pub fn new(top_left: Point, top_right: Point, bottom_right: Point, bottom_left: Point) -> Self {
        Self {
            top_left,
            top_right,
            bottom_right,
            bottom_left,
        }
    }

    /// The corners of the canonical rectangle itself, `(0,0)` to `(W-1,H-1)`
    pub fn canonical(resolution: Resolution) -> Self {
        let right = resolution.width.saturating_sub(1) as f64;
        let bottom = resolution.height.saturating_sub(1) as f64;
        Self::new(
            Point::new(0.0, 0.0),
            Point::new(right, 0.0),
            Point::new(right, bottom),
            Point::new(0.0, bottom),
        )
    }

    pub fn points(&self) -> [Point; 4] {
        [
            self.top_left,
            self.top_right,
            self.bottom_right,
            self.bottom_left,
        ]
    }

    pub fn from_points(points: [Point; 4]) -> Self {
        Self::new(points[0], points[1], points[2], points[3])
    }

    pub fn is_within(&self, resolution: Resolution) -> bool {
        self.points().iter().all(|p| p.is_within(resolution))
    }
}

impl fmt::Display for CornerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TL({}) TR({}) BR({}) BL({})",
            self.top_left, self.top_right, self.bottom_right, self.bottom_left
        )
    }
}

/// Display configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayConfig {
    pub width: u32,
    pub height: u32,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        let resolution = Resolution::default();
        Self {
            width: resolution.width,
            height: resolution.height,
        }
    }
}

impl DisplayConfig {
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }
}

/// Benchmark configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchConfig {
    pub method: Method,
    pub repeat: u32,
    /// Publish frames to the web preview while benchmarking
    pub gui: bool,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            method: Method::Sequential,
            repeat: 100,
            gui: true,
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8092,
        }
    }
}

/// Saved corner calibration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CalibrationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corners: Option<CornerSet>,
}

/// Virtual camera output
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputConfig {
    /// v4l2loopback device, e.g. /dev/video10
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub display: DisplayConfig,

    #[serde(default)]
    pub bench: BenchConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub calibration: CalibrationConfig,

    #[serde(default)]
    pub output: OutputConfig,
}

impl Config {
    /// Load configuration from a file, or create default if it doesn't exist
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {:?}", path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config from {:?}", path))?;
            config
                .validate()
                .with_context(|| format!("Invalid configuration in {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            tracing::info!("Created default configuration at {:?}", path);
            Ok(config)
        }
    }

    /// Reject values the command line parsers would refuse
    pub fn validate(&self) -> Result<()> {
        let display = &self.display;
        if display.width == 0 || display.height == 0 {
            return Err(ParseError::EmptyResolution(display.width, display.height).into());
        }
        Ok(())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory {:?}", parent))?;
        }

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_point() {
        let p: Point = "242,172".parse().unwrap();
        assert_eq!(p, Point::new(242.0, 172.0));

        assert!("242".parse::<Point>().is_err());
        assert!("-1,5".parse::<Point>().is_err());
        assert!("a,b".parse::<Point>().is_err());
        assert!("1.5,2".parse::<Point>().is_err());
    }

    #[test]
    fn test_parse_resolution() {
        assert_eq!("1920x1080".parse::<Resolution>().unwrap(), Resolution::new(1920, 1080));
        assert_eq!("640X480".parse::<Resolution>().unwrap(), Resolution::new(640, 480));
        assert!("1920*1080".parse::<Resolution>().is_err());
        assert_eq!(
            "0x1080".parse::<Resolution>(),
            Err(ParseError::EmptyResolution(0, 1080))
        );
    }

    #[test]
    fn test_canonical_corners() {
        let corners = CornerSet::canonical(Resolution::new(1920, 1080));
        assert_eq!(corners.top_left, Point::new(0.0, 0.0));
        assert_eq!(corners.bottom_right, Point::new(1919.0, 1079.0));
        assert!(corners.is_within(Resolution::new(1920, 1080)));
    }

    #[test]
    fn test_corners_outside_frame() {
        let corners = CornerSet::canonical(Resolution::new(1920, 1080));
        assert!(!corners.is_within(Resolution::new(1280, 720)));
    }

    #[test]
    fn test_config_round_trip() {
        let path = std::env::temp_dir().join(format!("keystone-config-{}.toml", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let created = Config::load_or_create(&path).unwrap();
        assert!(path.exists());
        assert_eq!(created.bench.repeat, 100);
        assert!(created.calibration.corners.is_none());

        let mut config = created;
        config.bench.method = Method::Parallel;
        config.calibration.corners = Some(CornerSet::canonical(Resolution::new(640, 480)));
        config.save(&path).unwrap();

        let loaded = Config::load_or_create(&path).unwrap();
        assert_eq!(loaded.bench.method, Method::Parallel);
        assert_eq!(loaded.calibration.corners, config.calibration.corners);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_config_rejects_empty_display() {
        let path = std::env::temp_dir().join(format!("keystone-empty-{}.toml", std::process::id()));
        std::fs::write(&path, "[display]\nwidth = 0\nheight = 1080\n").unwrap();

        let err = Config::load_or_create(&path).unwrap_err();
        assert_eq!(
            err.downcast_ref::<ParseError>(),
            Some(&ParseError::EmptyResolution(0, 1080))
        );

        std::fs::remove_file(&path).unwrap();
    }
}
