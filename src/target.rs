//! Render target parsing
//!
//! Turns the caller's `size` string plus the requested output kind into
//! concrete dimensions. Accepted shapes:
//!
//! - omitted with PDF output: A4 portrait with a 1cm margin
//! - `"5in*7.5in"`, `"10cm*20cm"`: explicit paper size, no margin
//! - `"800px*600px"`: 800×600 viewport, output hard-clipped to 800×600
//! - `"1920px"`: 1920 wide viewport, 4:3 height, full page captured
//! - `"Letter"`, `"A4"`, ...: named paper format, portrait, 1cm margin
//!
//! Everything else is rejected before a job is queued.

use serde::{Deserialize, Serialize};

use crate::{ClipRect, Error, Result, Viewport};

/// Width used when an image is requested without a size
pub const DEFAULT_IMAGE_WIDTH: u32 = 1240;

/// Paper format used when a PDF is requested without a size
pub const DEFAULT_PAPER_FORMAT: &str = "A4";

/// Largest accepted pixel dimension
pub const MAX_PIXELS: u32 = 16384;

/// Named paper formats and their portrait size in inches
const PAPER_FORMATS: &[(&str, f64, f64)] = &[
    ("A3", 11.69, 16.54),
    ("A4", 8.27, 11.69),
    ("A5", 5.83, 8.27),
    ("Legal", 8.5, 14.0),
    ("Letter", 8.5, 11.0),
    ("Tabloid", 11.0, 17.0),
    ("Ledger", 17.0, 11.0),
];

/// Broad class of artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Image,
    Pdf,
}

/// Concrete artifact encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Png,
    Jpeg,
    Gif,
    Pdf,
}

impl OutputFormat {
    /// Every format in server preference order
    pub const ALL: [OutputFormat; 4] = [
        OutputFormat::Png,
        OutputFormat::Jpeg,
        OutputFormat::Gif,
        OutputFormat::Pdf,
    ];

    pub fn kind(self) -> OutputKind {
        match self {
            OutputFormat::Pdf => OutputKind::Pdf,
            _ => OutputKind::Image,
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            OutputFormat::Png => "image/png",
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::Gif => "image/gif",
            OutputFormat::Pdf => "application/pdf",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Jpeg => "jpeg",
            OutputFormat::Gif => "gif",
            OutputFormat::Pdf => "pdf",
        }
    }

    pub fn from_content_type(content_type: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|f| f.content_type().eq_ignore_ascii_case(content_type))
    }
}

/// Physical unit accepted in paper dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LengthUnit {
    In,
    Cm,
    Mm,
}

impl LengthUnit {
    const SUFFIXES: [(&'static str, LengthUnit); 3] = [
        ("in", LengthUnit::In),
        ("cm", LengthUnit::Cm),
        ("mm", LengthUnit::Mm),
    ];

    fn per_inch(self) -> f64 {
        match self {
            LengthUnit::In => 1.0,
            LengthUnit::Cm => 2.54,
            LengthUnit::Mm => 25.4,
        }
    }
}

/// A length on paper
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhysicalLength {
    pub value: f64,
    pub unit: LengthUnit,
}

impl PhysicalLength {
    pub fn new(value: f64, unit: LengthUnit) -> Self {
        Self { value, unit }
    }

    pub fn zero() -> Self {
        Self::new(0.0, LengthUnit::Cm)
    }

    pub fn inches(&self) -> f64 {
        self.value / self.unit.per_inch()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    Portrait,
    Landscape,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageFormat {
    /// Canonical name from the known format table
    Named(String),
    Explicit {
        width: PhysicalLength,
        height: PhysicalLength,
    },
}

/// Paper geometry for PDF output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Paper {
    pub format: PageFormat,
    pub orientation: Orientation,
    pub margin: PhysicalLength,
}

impl Paper {
    /// A named format, portrait, with the default 1cm margin
    fn named(name: &str) -> Self {
        Self {
            format: PageFormat::Named(name.to_string()),
            orientation: Orientation::Portrait,
            margin: PhysicalLength::new(1.0, LengthUnit::Cm),
        }
    }

    /// Paper width and height in inches, with orientation applied
    pub fn size_inches(&self) -> (f64, f64) {
        let (width, height) = match &self.format {
            PageFormat::Named(name) => lookup_format(name)
                .map(|(_, w, h)| (w, h))
                .unwrap_or((8.27, 11.69)),
            PageFormat::Explicit { width, height } => (width.inches(), height.inches()),
        };
        match self.orientation {
            Orientation::Portrait => (width, height),
            Orientation::Landscape => (height, width),
        }
    }
}

impl Default for Paper {
    fn default() -> Self {
        Paper::named(DEFAULT_PAPER_FORMAT)
    }
}

/// Concrete dimensions a job renders with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderTargetSpec {
    pub viewport: Viewport,
    /// Hard clip applied to image output
    pub clip: Option<ClipRect>,
    /// Page geometry applied to PDF output
    pub paper: Option<Paper>,
}

impl RenderTargetSpec {
    fn pixels(viewport: Viewport, clip: Option<ClipRect>) -> Self {
        Self {
            viewport,
            clip,
            paper: None,
        }
    }

    fn paper(paper: Paper) -> Self {
        Self {
            viewport: Viewport::default(),
            clip: None,
            paper: Some(paper),
        }
    }
}

/// Parse a raw size string for the given output kind.
///
/// # Examples
///
/// ```
/// use snapcluster::target::{parse_target, OutputKind};
///
/// let spec = parse_target(Some("1920px"), OutputKind::Image).unwrap();
/// assert_eq!((spec.viewport.width, spec.viewport.height), (1920, 1440));
/// assert!(spec.clip.is_none());
/// ```
pub fn parse_target(size: Option<&str>, kind: OutputKind) -> Result<RenderTargetSpec> {
    let raw = match size.map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => raw,
        None => {
            return Ok(match kind {
                OutputKind::Pdf => RenderTargetSpec::paper(Paper::named(DEFAULT_PAPER_FORMAT)),
                OutputKind::Image => width_only(DEFAULT_IMAGE_WIDTH)?,
            })
        }
    };

    let halves: Vec<&str> = raw.split('*').map(str::trim).collect();
    if let [width, height] = halves.as_slice() {
        if let (Some(w), Some(h)) = (split_physical(width), split_physical(height)) {
            let paper = Paper {
                format: PageFormat::Explicit {
                    width: physical(w, raw)?,
                    height: physical(h, raw)?,
                },
                orientation: Orientation::Portrait,
                margin: PhysicalLength::zero(),
            };
            return Ok(RenderTargetSpec::paper(paper));
        }

        if let (Some(w), Some(h)) = (strip_px(width), strip_px(height)) {
            let width = pixels(w, raw)?;
            let height = pixels(h, raw)?;
            let clip = ClipRect::at_origin(f64::from(width), f64::from(height));
            return Ok(RenderTargetSpec::pixels(Viewport { width, height }, Some(clip)));
        }
    } else if halves.len() == 1 {
        if let Some(w) = strip_px(raw) {
            return width_only(pixels(w, raw)?);
        }
    }

    match lookup_format(raw) {
        Some((name, _, _)) => Ok(RenderTargetSpec::paper(Paper::named(name))),
        None => Err(Error::InvalidRenderSpec(format!("unrecognized size {:?}", raw))),
    }
}

/// Viewport of the given width with a 4:3 height and no forced clip
fn width_only(width: u32) -> Result<RenderTargetSpec> {
    let height = (u64::from(width) * 3 / 4) as u32;
    if height == 0 {
        return Err(Error::InvalidRenderSpec(format!(
            "width {}px is too small to derive a height",
            width
        )));
    }
    Ok(RenderTargetSpec::pixels(Viewport { width, height }, None))
}

fn lookup_format(name: &str) -> Option<(&'static str, f64, f64)> {
    PAPER_FORMATS
        .iter()
        .copied()
        .find(|(known, _, _)| known.eq_ignore_ascii_case(name))
}

fn strip_px(s: &str) -> Option<&str> {
    let cut = s.len().checked_sub(2)?;
    if s.is_char_boundary(cut) && s[cut..].eq_ignore_ascii_case("px") {
        Some(&s[..cut])
    } else {
        None
    }
}

fn split_physical(s: &str) -> Option<(&str, LengthUnit)> {
    let cut = s.len().checked_sub(2)?;
    if !s.is_char_boundary(cut) {
        return None;
    }
    let suffix = &s[cut..];
    LengthUnit::SUFFIXES
        .iter()
        .find(|(name, _)| suffix.eq_ignore_ascii_case(name))
        .map(|&(_, unit)| (&s[..cut], unit))
}

fn pixels(number: &str, raw: &str) -> Result<u32> {
    match number.trim().parse::<u32>() {
        Ok(value) if value > 0 && value <= MAX_PIXELS => Ok(value),
        Ok(value) => Err(Error::InvalidRenderSpec(format!(
            "{}px in {:?} is outside 1..={}",
            value, raw, MAX_PIXELS
        ))),
        Err(_) => Err(Error::InvalidRenderSpec(format!(
            "{:?} is not a pixel count in {:?}",
            number, raw
        ))),
    }
}

fn physical((number, unit): (&str, LengthUnit), raw: &str) -> Result<PhysicalLength> {
    match number.trim().parse::<f64>() {
        Ok(value) if value.is_finite() && value > 0.0 => Ok(PhysicalLength::new(value, unit)),
        _ => Err(Error::InvalidRenderSpec(format!(
            "{:?} is not a positive length in {:?}",
            number, raw
        ))),
    }
}
