//! # FOV
//!
//! Field of view conversions shared by fixers. Games store their FOV in one of a few shapes: an
//! angle in degrees, an angle in radians, or a plain multiplier on some internal base FOV.
//! [`FovStrategy`] picks the shape and [`AspectScale`] describes how much wider the target
//! screen is than the one the game was designed for.
//!
//! Scaling is Hor+: the vertical FOV is kept and the horizontal FOV widens with the screen.
//! Screens narrower than the native aspect keep the native FOV.

use crate::config::Config;

/// 16:9
pub const ASPECT_16_9: f32 = 16.0 / 9.0;
/// 4:3
pub const ASPECT_4_3: f32 = 4.0 / 3.0;

/// Target aspect ratio relative to the game's native one
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AspectScale {
    /// Aspect ratio the game assumes
    pub native: f32,
    /// Aspect ratio of the output
    pub target: f32,
}

impl AspectScale {
    /// Scale from `native` to `target`
    pub fn new(native: f32, target: f32) -> Self {
        Self { native, target }
    }

    /// Scale from `native` to a `width` x `height` output
    pub fn from_resolution(native: f32, width: u32, height: u32) -> Self {
        Self::new(native, width as f32 / height as f32)
    }

    /// Scale from `native` to the configured resolution
    pub fn from_config(native: f32, config: &Config) -> Self {
        Self::from_resolution(native, config.width, config.height)
    }

    /// `target / native`, never below 1
    pub fn ratio(&self) -> f32 {
        (self.target / self.native).max(1.0)
    }

    /// Whether the output is wider than native
    pub fn is_wider(&self) -> bool {
        self.target > self.native
    }
}

/// How a game stores its FOV
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FovStrategy {
    /// Horizontal angle in degrees
    Degrees,
    /// Horizontal angle in radians
    Radians,
    /// Multiplier on a base FOV
    Multiplier,
}

impl FovStrategy {
    /// Widens `value` for `scale` and applies the user's `factor`
    pub fn apply(self, value: f32, scale: AspectScale, factor: f32) -> f32 {
        match self {
            FovStrategy::Degrees => hor_plus(value.to_radians(), scale.ratio()).to_degrees() * factor,
            FovStrategy::Radians => hor_plus(value, scale.ratio()) * factor,
            FovStrategy::Multiplier => value * scale.ratio() * factor,
        }
    }

    /// [`FovStrategy::apply`] with the aspect and factor from `config`
    pub fn apply_config(self, value: f32, native: f32, config: &Config) -> f32 {
        self.apply(value, AspectScale::from_config(native, config), config.fov_factor)
    }
}

/// Horizontal FOV (radians) that keeps the vertical FOV when the screen is `ratio` times wider
pub fn hor_plus(fov: f32, ratio: f32) -> f32 {
    2.0 * ((fov / 2.0).tan() * ratio).atan()
}

/// Vertical FOV (radians) for a horizontal FOV at `aspect`
pub fn vertical_from_horizontal(fov: f32, aspect: f32) -> f32 {
    2.0 * ((fov / 2.0).tan() / aspect).atan()
}

/// Horizontal FOV (radians) for a vertical FOV at `aspect`
pub fn horizontal_from_vertical(fov: f32, aspect: f32) -> f32 {
    2.0 * ((fov / 2.0).tan() * aspect).atan()
}
