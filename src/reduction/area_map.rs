//! Area-compensation map for sector integration.
//!
//! For every unmasked pixel inside the bounding box of a sector the map stores
//! which radial and azimuthal bins the pixel feeds and with what fraction of
//! its area. With clipping compensation each pixel is sampled on a
//! `SUBDIVISIONS x SUBDIVISIONS` grid, so pixels cut by an arc or a radius
//! boundary contribute only the part lying inside the sector; without it a
//! pixel is in or out depending on its center.
//!
//! Building the map is the expensive part of sector integration. It is a pure
//! function of [`AreaMapKey`] plus the mask, and is rebuilt only when the key
//! changes.

use crate::data::calibration::SectorGeometry;
use ndarray::{Array1, Array2, ArrayView2, ErrorKind, ShapeError};

/// Sub-pixel grid size per axis when clipping compensation is on.
pub const SUBDIVISIONS: usize = 8;

/// Everything the map depends on besides the mask contents.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AreaMapKey {
    /// Sector geometry.
    pub geometry: SectorGeometry,
    /// `(height, width)` of one frame.
    pub frame_shape: (usize, usize),
    /// Bumped by the owner whenever its mask is replaced.
    pub mask_generation: u64,
    /// Radial profile length.
    pub radial_bins: usize,
    /// Azimuthal profile length.
    pub azimuthal_bins: usize,
}

/// Area of pixel `(row, col)` assigned to profile bin `bin`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Contribution {
    /// Pixel row.
    pub row: usize,
    /// Pixel column.
    pub col: usize,
    /// Profile bin.
    pub bin: usize,
    /// Fraction of the pixel area, in `(0, 1]`.
    pub weight: f64,
}

/// Precomputed pixel-to-bin weights for one sector.
#[derive(Debug, Clone)]
pub struct AreaMap {
    key: AreaMapKey,
    radial: Vec<Contribution>,
    azimuthal: Vec<Contribution>,
    radial_area: Array1<f64>,
    azimuthal_area: Array1<f64>,
}

impl AreaMap {
    /// Compute the map for `key`, skipping pixels where `mask` is true.
    ///
    /// Pixels outside the frame never contribute, so sectors reaching past
    /// the detector edge simply have less area in their outer bins. Fails if
    /// the mask shape differs from `key.frame_shape`.
    pub fn build(key: AreaMapKey, mask: Option<&Array2<bool>>) -> Result<Self, ShapeError> {
        let geometry = &key.geometry;
        let [cx, cy] = geometry.center;
        let [r_inner, r_outer] = geometry.radii;
        let (height, width) = key.frame_shape;
        if mask.is_some_and(|m| m.dim() != key.frame_shape) {
            return Err(ShapeError::from_kind(ErrorKind::IncompatibleShape));
        }
        let radial_bins = key.radial_bins.max(1);
        let azimuthal_bins = key.azimuthal_bins.max(1);

        let dr = (r_outer - r_inner) / radial_bins as f64;
        let dphi = geometry.angular_span() / azimuthal_bins as f64;
        let n = if geometry.clipping_compensation {
            SUBDIVISIONS
        } else {
            1
        };
        let sample_area = 1.0 / (n * n) as f64;

        let col_range = clamp_range(cx - r_outer, cx + r_outer, width);
        let row_range = clamp_range(cy - r_outer, cy + r_outer, height);

        let mut radial = Vec::new();
        let mut azimuthal = Vec::new();
        let mut radial_area = Array1::zeros(radial_bins);
        let mut azimuthal_area = Array1::zeros(azimuthal_bins);
        let mut pixel_radial: Vec<(usize, f64)> = Vec::new();
        let mut pixel_azimuthal: Vec<(usize, f64)> = Vec::new();

        for row in row_range {
            for col in col_range.clone() {
                if mask.is_some_and(|m| m[[row, col]]) {
                    continue;
                }
                pixel_radial.clear();
                pixel_azimuthal.clear();

                for sy in 0..n {
                    let dy = row as f64 + (sy as f64 + 0.5) / n as f64 - cy;
                    for sx in 0..n {
                        let dx = col as f64 + (sx as f64 + 0.5) / n as f64 - cx;
                        let Some((r, offset)) = locate(geometry, dx, dy) else {
                            continue;
                        };
                        let rbin = (((r - r_inner) / dr) as usize).min(radial_bins - 1);
                        let abin = ((offset / dphi) as usize).min(azimuthal_bins - 1);
                        add_weight(&mut pixel_radial, rbin, sample_area);
                        add_weight(&mut pixel_azimuthal, abin, sample_area);
                    }
                }

                for &(bin, weight) in &pixel_radial {
                    radial_area[bin] += weight;
                    radial.push(Contribution {
                        row,
                        col,
                        bin,
                        weight,
                    });
                }
                for &(bin, weight) in &pixel_azimuthal {
                    azimuthal_area[bin] += weight;
                    azimuthal.push(Contribution {
                        row,
                        col,
                        bin,
                        weight,
                    });
                }
            }
        }

        Ok(Self {
            key,
            radial,
            azimuthal,
            radial_area,
            azimuthal_area,
        })
    }

    /// Key the map was built for.
    pub fn key(&self) -> &AreaMapKey {
        &self.key
    }

    /// Compensated area of each radial bin.
    pub fn radial_area(&self) -> &Array1<f64> {
        &self.radial_area
    }

    /// Compensated area of each azimuthal bin.
    pub fn azimuthal_area(&self) -> &Array1<f64> {
        &self.azimuthal_area
    }

    /// Total sector area inside the frame and outside the mask.
    pub fn total_area(&self) -> f64 {
        self.radial_area.sum()
    }

    /// Radial and azimuthal profiles of one frame.
    ///
    /// Each bin is the area-weighted mean intensity of the pixels feeding it.
    /// Bins with no area are 0.
    pub fn integrate(&self, frame: ArrayView2<'_, f64>) -> (Array1<f64>, Array1<f64>) {
        (
            accumulate(&self.radial, &self.radial_area, frame),
            accumulate(&self.azimuthal, &self.azimuthal_area, frame),
        )
    }
}

/// Default azimuthal profile length for `geometry`.
///
/// One bin per pixel of arc at the outer radius. Without clipping compensation
/// a bin only receives pixels whose center falls inside it, so the count is
/// lowered until every bin holds at least one pixel center of the sector and a
/// uniform frame gives a flat profile. Bins lying outside the frame or under
/// the mask can still be empty.
pub fn default_azimuthal_bins(geometry: &SectorGeometry) -> usize {
    let span = geometry.angular_span();
    let arc_bins = (span * geometry.radii[1]).ceil().max(1.0) as usize;
    if geometry.clipping_compensation {
        return arc_bins;
    }

    let mut offsets = pixel_center_offsets(geometry);
    offsets.sort_by(f64::total_cmp);
    let (Some(&first), Some(&last)) = (offsets.first(), offsets.last()) else {
        return arc_bins;
    };
    let widest_gap = offsets
        .windows(2)
        .map(|pair| pair[1] - pair[0])
        .chain([first, span - last])
        .fold(0.0, f64::max);
    if widest_gap <= 0.0 {
        return arc_bins;
    }
    // Bins strictly wider than the widest gap cannot fall between two centers.
    let filled = ((span / widest_gap).ceil() as usize).saturating_sub(1).max(1);
    arc_bins.min(filled)
}

/// Angular offsets of every pixel center inside the sector, ignoring frame
/// bounds and mask.
fn pixel_center_offsets(geometry: &SectorGeometry) -> Vec<f64> {
    let [cx, cy] = geometry.center;
    let r_outer = geometry.radii[1];
    let rows = (cy - r_outer).floor() as i64..(cy + r_outer).ceil() as i64;
    let cols = (cx - r_outer).floor() as i64..(cx + r_outer).ceil() as i64;

    let mut offsets = Vec::new();
    for row in rows {
        let dy = row as f64 + 0.5 - cy;
        for col in cols.clone() {
            let dx = col as f64 + 0.5 - cx;
            if let Some((_, offset)) = locate(geometry, dx, dy) {
                offsets.push(offset);
            }
        }
    }
    offsets
}

/// Radius and angular offset into the primary sector of the point `(dx, dy)`
/// from the beam center, folding the symmetric copy onto the primary sector.
fn locate(geometry: &SectorGeometry, dx: f64, dy: f64) -> Option<(f64, f64)> {
    let [r_inner, r_outer] = geometry.radii;
    let r = dx.hypot(dy);
    if r < r_inner || r >= r_outer {
        return None;
    }
    let theta = dy.atan2(dx);
    let offset = geometry.angle_offset(theta).or_else(|| {
        geometry
            .symmetry
            .fold(theta)
            .and_then(|folded| geometry.angle_offset(folded))
    })?;
    Some((r, offset))
}

fn accumulate(
    contributions: &[Contribution],
    area: &Array1<f64>,
    frame: ArrayView2<'_, f64>,
) -> Array1<f64> {
    let mut sums = Array1::zeros(area.len());
    for c in contributions {
        sums[c.bin] += c.weight * frame[[c.row, c.col]];
    }
    for (sum, &a) in sums.iter_mut().zip(area.iter()) {
        *sum = if a > 0.0 { *sum / a } else { 0.0 };
    }
    sums
}

fn add_weight(weights: &mut Vec<(usize, f64)>, bin: usize, weight: f64) {
    match weights.iter_mut().find(|(b, _)| *b == bin) {
        Some((_, w)) => *w += weight,
        None => weights.push((bin, weight)),
    }
}

/// Pixel indices overlapping `[lo, hi]`, clipped to `0..len`.
fn clamp_range(lo: f64, hi: f64, len: usize) -> std::ops::Range<usize> {
    let start = lo.floor().max(0.0) as usize;
    let end = (hi.ceil().max(0.0) as usize).min(len);
    start.min(end)..end
}
