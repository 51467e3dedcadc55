//! Transform requests as they arrive on the wire, and the validated plan the
//! pipeline executes.
//!
//! A [`TransformSpec`] is a set of optional stages. Field order in the input
//! carries no meaning: the pipeline applies stages in a fixed order and the
//! fingerprint hashes a canonical form.
//!
//! Numeric fields are wide on the wire; range violations of any magnitude
//! surface from [`TransformSpec::validate`] as `InvalidSpec`.

use crate::errors::{MediaError, MediaResult};
use image::ImageFormat;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Largest edge accepted for resize and crop rectangles.
pub const MAX_DIMENSION: u32 = 10_000;

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct TransformSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resize: Option<ResizeSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crop: Option<CropSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<FilterSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flip: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compress: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watermark: Option<WatermarkSpec>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ResizeSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<i64>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct CropSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<i64>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct FilterSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grayscale: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sepia: Option<bool>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct WatermarkSpec {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opacity: Option<f32>,
}

/// Output codecs the pipeline can produce.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OutputFormat {
    Jpeg,
    Png,
    Webp,
    Gif,
    Tiff,
    Avif,
}

impl OutputFormat {
    pub const ALL: [OutputFormat; 6] = [
        OutputFormat::Jpeg,
        OutputFormat::Png,
        OutputFormat::Webp,
        OutputFormat::Gif,
        OutputFormat::Tiff,
        OutputFormat::Avif,
    ];

    pub fn name(self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "jpeg",
            OutputFormat::Png => "png",
            OutputFormat::Webp => "webp",
            OutputFormat::Gif => "gif",
            OutputFormat::Tiff => "tiff",
            OutputFormat::Avif => "avif",
        }
    }

    /// Parse an allow-listed format name (case-insensitive).
    pub fn from_name(name: &str) -> MediaResult<Self> {
        let lowered = name.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|format| format.name() == lowered)
            .ok_or_else(|| MediaError::UnsupportedFormat(name.to_string()))
    }

    /// Map a stored MIME type back to a format; `image/jpg` is tolerated.
    pub fn from_mime(mime: &str) -> MediaResult<Self> {
        let lowered = mime.trim().to_ascii_lowercase();
        match lowered.strip_prefix("image/") {
            Some("jpg") => Ok(OutputFormat::Jpeg),
            Some(sub) => {
                Self::from_name(sub).map_err(|_| MediaError::UnsupportedFormat(mime.into()))
            }
            None => Err(MediaError::UnsupportedFormat(mime.to_string())),
        }
    }

    pub fn mime_type(self) -> String {
        format!("image/{}", self.name())
    }

    pub fn image_format(self) -> ImageFormat {
        match self {
            OutputFormat::Jpeg => ImageFormat::Jpeg,
            OutputFormat::Png => ImageFormat::Png,
            OutputFormat::Webp => ImageFormat::WebP,
            OutputFormat::Gif => ImageFormat::Gif,
            OutputFormat::Tiff => ImageFormat::Tiff,
            OutputFormat::Avif => ImageFormat::Avif,
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Anchor for the watermark overlay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatermarkPosition {
    North,
    NorthEast,
    East,
    SouthEast,
    South,
    SouthWest,
    West,
    NorthWest,
    Center,
}

impl WatermarkPosition {
    pub fn from_name(name: &str) -> MediaResult<Self> {
        let position = match name.trim().to_ascii_lowercase().as_str() {
            "north" => Self::North,
            "northeast" => Self::NorthEast,
            "east" => Self::East,
            "southeast" => Self::SouthEast,
            "south" => Self::South,
            "southwest" => Self::SouthWest,
            "west" => Self::West,
            "northwest" => Self::NorthWest,
            "center" | "centre" => Self::Center,
            _ => {
                return Err(MediaError::invalid_spec(format!(
                    "unknown watermark position `{name}`"
                )));
            }
        };
        Ok(position)
    }

    fn canonical_name(self) -> &'static str {
        match self {
            Self::North => "north",
            Self::NorthEast => "northeast",
            Self::East => "east",
            Self::SouthEast => "southeast",
            Self::South => "south",
            Self::SouthWest => "southwest",
            Self::West => "west",
            Self::NorthWest => "northwest",
            Self::Center => "center",
        }
    }

    /// Top-left corner for an overlay of `overlay` size on a `canvas` sized image.
    pub fn origin(self, canvas: (u32, u32), overlay: (u32, u32)) -> (i64, i64) {
        let (cw, ch) = (canvas.0 as i64, canvas.1 as i64);
        let (ow, oh) = (overlay.0 as i64, overlay.1 as i64);
        let (left, hmid, right) = (0, (cw - ow) / 2, cw - ow);
        let (top, vmid, bottom) = (0, (ch - oh) / 2, ch - oh);
        match self {
            Self::North => (hmid, top),
            Self::NorthEast => (right, top),
            Self::East => (right, vmid),
            Self::SouthEast => (right, bottom),
            Self::South => (hmid, bottom),
            Self::SouthWest => (left, bottom),
            Self::West => (left, vmid),
            Self::NorthWest => (left, top),
            Self::Center => (hmid, vmid),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct WatermarkPlan {
    pub url: Url,
    pub position: WatermarkPosition,
    pub opacity: f32,
}

/// A structurally valid transform with every stage typed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TransformPlan {
    pub resize: Option<(u32, u32)>,
    /// Clockwise degrees in `(0, 360)`.
    pub rotate: Option<f64>,
    pub crop: Option<CropRect>,
    pub format: Option<OutputFormat>,
    pub grayscale: bool,
    pub sepia: bool,
    pub flip: bool,
    pub mirror: bool,
    pub quality: Option<u8>,
    pub watermark: Option<WatermarkPlan>,
}

fn required(field: &str, value: Option<i64>) -> MediaResult<i64> {
    value.ok_or_else(|| MediaError::invalid_spec(format!("{field} is required")))
}

fn dimension(field: &str, value: Option<i64>) -> MediaResult<u32> {
    let value = required(field, value)?;
    match u32::try_from(value) {
        Ok(edge) if (1..=MAX_DIMENSION).contains(&edge) => Ok(edge),
        _ => Err(MediaError::invalid_spec(format!(
            "{field} must be between 1 and {MAX_DIMENSION}"
        ))),
    }
}

fn offset(field: &str, value: Option<i64>) -> MediaResult<u32> {
    let value = required(field, value)?;
    u32::try_from(value)
        .map_err(|_| MediaError::invalid_spec(format!("{field} must be a non-negative pixel offset")))
}

impl TransformSpec {
    pub fn is_empty(&self) -> bool {
        self.canonical() == TransformSpec::default()
    }

    /// Normalized copy used for hashing: `false` flags and empty blocks are
    /// dropped, enum-like strings are lowercased.
    pub fn canonical(&self) -> TransformSpec {
        let filters = self.filters.as_ref().and_then(|f| {
            let normalized = FilterSpec {
                grayscale: f.grayscale.filter(|on| *on),
                sepia: f.sepia.filter(|on| *on),
            };
            (normalized != FilterSpec::default()).then_some(normalized)
        });
        let watermark = self.watermark.as_ref().map(|w| WatermarkSpec {
            url: w.url.trim().to_string(),
            position: w.position.as_ref().map(|p| {
                WatermarkPosition::from_name(p)
                    .map(|pos| pos.canonical_name().to_string())
                    .unwrap_or_else(|_| p.trim().to_ascii_lowercase())
            }),
            opacity: w.opacity.filter(|o| *o != 1.0),
        });
        TransformSpec {
            resize: self.resize.clone(),
            rotate: normalized_rotation(self.rotate),
            crop: self.crop.clone(),
            format: self
                .format
                .as_ref()
                .map(|f| f.trim().to_ascii_lowercase()),
            filters,
            flip: self.flip.filter(|on| *on),
            mirror: self.mirror.filter(|on| *on),
            compress: self.compress,
            watermark,
        }
    }

    /// Structural validation: ranges, allow-lists, mutually required fields.
    pub fn validate(&self) -> MediaResult<TransformPlan> {
        let resize = match &self.resize {
            Some(resize) => Some((
                dimension("resize.width", resize.width)?,
                dimension("resize.height", resize.height)?,
            )),
            None => None,
        };

        let crop = match &self.crop {
            Some(crop) => Some(CropRect {
                x: offset("crop.x", crop.x)?,
                y: offset("crop.y", crop.y)?,
                width: dimension("crop.width", crop.width)?,
                height: dimension("crop.height", crop.height)?,
            }),
            None => None,
        };

        let format = self
            .format
            .as_deref()
            .map(OutputFormat::from_name)
            .transpose()?;

        let quality = self
            .compress
            .map(|q| {
                u8::try_from(q)
                    .ok()
                    .filter(|q| (1..=100).contains(q))
                    .ok_or_else(|| MediaError::invalid_spec("compress must be between 1 and 100"))
            })
            .transpose()?;

        if self.rotate.is_some_and(|d| !d.is_finite()) {
            return Err(MediaError::invalid_spec("rotate must be a finite angle"));
        }

        let watermark = match &self.watermark {
            Some(w) => Some(validate_watermark(w)?),
            None => None,
        };

        let filters = self.filters.clone().unwrap_or_default();
        let plan = TransformPlan {
            resize,
            rotate: normalized_rotation(self.rotate),
            crop,
            format,
            grayscale: filters.grayscale.unwrap_or(false),
            sepia: filters.sepia.unwrap_or(false),
            flip: self.flip.unwrap_or(false),
            mirror: self.mirror.unwrap_or(false),
            quality,
            watermark,
        };
        Ok(plan)
    }
}

/// Rotation folded into `[0, 360)`; a full turn is no rotation at all.
fn normalized_rotation(degrees: Option<f64>) -> Option<f64> {
    degrees
        .filter(|d| d.is_finite())
        .map(|d| d.rem_euclid(360.0))
        // rem_euclid rounds tiny negatives up to exactly 360
        .map(|d| if d >= 360.0 { 0.0 } else { d })
        .filter(|d| *d != 0.0)
}

fn validate_watermark(spec: &WatermarkSpec) -> MediaResult<WatermarkPlan> {
    let url = Url::parse(spec.url.trim())
        .map_err(|err| MediaError::invalid_spec(format!("watermark.url: {err}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(MediaError::invalid_spec(
            "watermark.url must use http or https",
        ));
    }
    let position = spec
        .position
        .as_deref()
        .ok_or_else(|| MediaError::invalid_spec("watermark.position is required"))
        .and_then(WatermarkPosition::from_name)?;
    let opacity = spec.opacity.unwrap_or(1.0);
    if !opacity.is_finite() || !(0.0..=1.0).contains(&opacity) {
        return Err(MediaError::invalid_spec(
            "watermark.opacity must be between 0 and 1",
        ));
    }
    Ok(WatermarkPlan {
        url,
        position,
        opacity,
    })
}
