//! Annotation database import.
//!
//! Scans a directory for images paired with ibug-style `.pts` landmark
//! files, optionally reads a CSV of detection rectangles, and hands the
//! corpus over as parallel lists ready for [`crate::InputData`]. This is a
//! collaborator of the core engine: everything here happens before
//! normalization and fitting.

use std::fs;
use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use log::{debug, info};
use nalgebra::Vector2;

use crate::error::{Error, Result};
use crate::image::Image;
use crate::shape::{create_rectangle, shape_bounds, Rect, Shape};

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

/// Import-time options.
#[derive(Debug, Clone, Default)]
pub struct ImportParameters {
    /// Downscale any image whose longer side exceeds this, scaling its
    /// shape and rectangle along with it.
    pub max_image_side_length: Option<u32>,
}

/// Landmark permutation for the 68-point ibug annotation scheme under
/// horizontal mirroring: entry `j` names the source landmark that becomes
/// landmark `j` in the mirrored shape.
pub const IBUG_68_MIRROR: [usize; 68] = [
    16, 15, 14, 13, 12, 11, 10, 9, 8, 7, 6, 5, 4, 3, 2, 1, 0, // jaw
    26, 25, 24, 23, 22, 21, 20, 19, 18, 17, // brows
    27, 28, 29, 30, // nose bridge
    35, 34, 33, 32, 31, // nose bottom
    45, 44, 43, 42, 47, 46, // right eye <- left eye
    39, 38, 37, 36, 41, 40, // left eye <- right eye
    54, 53, 52, 51, 50, 49, 48, // outer lip, top
    59, 58, 57, 56, 55, // outer lip, bottom
    64, 63, 62, 61, 60, // inner lip, top
    67, 66, 65, // inner lip, bottom
];

/// Load every image with a sibling `.pts` file from `directory`.
///
/// When `rectangles` is given it must hold one `x0 y0 x1 y1` line per
/// image, in the scan order (lexicographic by file name). Without it, each
/// shape's bounding box stands in as the detection rectangle.
pub fn load_database(
    directory: &Path,
    rectangles: Option<&Path>,
    params: &ImportParameters,
) -> Result<(Vec<Image>, Vec<Shape>, Vec<Rect>)> {
    let mut stems = annotated_image_files(directory)?;
    stems.sort();
    info!(
        "importing {} annotated images from {}",
        stems.len(),
        directory.display()
    );

    let mut images = Vec::with_capacity(stems.len());
    let mut shapes = Vec::with_capacity(stems.len());
    let mut factors = Vec::with_capacity(stems.len());

    for image_path in &stems {
        let (img, factor) = load_image(image_path, params)?;
        let mut shape = parse_pts(&image_path.with_extension("pts"))?;
        if factor != 1.0 {
            shape *= factor;
        }
        debug!(
            "loaded {} ({}x{}, scale {factor})",
            image_path.display(),
            img.width(),
            img.height()
        );
        images.push(img);
        shapes.push(shape);
        factors.push(factor);
    }

    let rects = match rectangles {
        Some(path) => {
            let mut rects = parse_rectangles(path)?;
            if rects.len() != images.len() {
                return Err(Error::FormatInvalid(format!(
                    "{} rectangles for {} images",
                    rects.len(),
                    images.len()
                )));
            }
            for (rect, factor) in rects.iter_mut().zip(&factors) {
                *rect *= *factor;
            }
            rects
        }
        None => shapes.iter().map(shape_bounds).collect(),
    };

    Ok((images, shapes, rects))
}

fn annotated_image_files(directory: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(directory)? {
        let path = entry?.path();
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| {
                let e = e.to_ascii_lowercase();
                IMAGE_EXTENSIONS.iter().any(|&known| known == e)
            })
            .unwrap_or(false);
        if is_image && path.with_extension("pts").is_file() {
            out.push(path);
        }
    }
    Ok(out)
}

fn load_image(path: &Path, params: &ImportParameters) -> Result<(Image, f32)> {
    let decoded = image::open(path)
        .map_err(|e| Error::FormatInvalid(format!("{}: {e}", path.display())))?;
    let mut luma = decoded.to_luma8();

    let mut factor = 1.0f32;
    if let Some(max_side) = params.max_image_side_length {
        let longest = luma.width().max(luma.height());
        if longest > max_side {
            factor = max_side as f32 / longest as f32;
            let w = (luma.width() as f32 * factor).round().max(1.0) as u32;
            let h = (luma.height() as f32 * factor).round().max(1.0) as u32;
            luma = image::imageops::resize(&luma, w, h, FilterType::CatmullRom);
        }
    }

    let (w, h) = (luma.width() as usize, luma.height() as usize);
    Ok((Image::from_luma8(w, h, luma.as_raw()), factor))
}

/// Parse an ibug `.pts` landmark file:
///
/// ```text
/// version: 1
/// n_points: 68
/// {
/// x y
/// ...
/// }
/// ```
fn parse_pts(path: &Path) -> Result<Shape> {
    let text = fs::read_to_string(path)?;
    let bad = |msg: &str| Error::FormatInvalid(format!("{}: {msg}", path.display()));

    let mut n_points: Option<usize> = None;
    let mut in_body = false;
    let mut points: Vec<(f32, f32)> = Vec::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if !in_body {
            if let Some(rest) = line.strip_prefix("n_points:") {
                n_points = Some(
                    rest.trim()
                        .parse()
                        .map_err(|_| bad("unreadable n_points"))?,
                );
            } else if line.starts_with('{') {
                in_body = true;
            }
            continue;
        }
        if line.starts_with('}') {
            break;
        }
        let mut parts = line.split_whitespace();
        let x: f32 = parts
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| bad("unreadable landmark"))?;
        let y: f32 = parts
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| bad("unreadable landmark"))?;
        points.push((x, y));
    }

    let expected = n_points.ok_or_else(|| bad("missing n_points"))?;
    if points.len() != expected {
        return Err(Error::ShapeDimensionMismatch {
            expected,
            got: points.len(),
        });
    }

    let mut shape = Shape::zeros(points.len());
    for (i, (x, y)) in points.iter().enumerate() {
        shape[(0, i)] = *x;
        shape[(1, i)] = *y;
    }
    Ok(shape)
}

/// Parse one `x0 y0 x1 y1` rectangle per line (comma or whitespace
/// separated).
fn parse_rectangles(path: &Path) -> Result<Vec<Rect>> {
    let text = fs::read_to_string(path)?;
    let bad = |line: usize| Error::FormatInvalid(format!("{}:{line}: unreadable rectangle", path.display()));

    let mut rects = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let values: Vec<f32> = line
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|t| !t.is_empty())
            .map(|t| t.parse().map_err(|_| bad(lineno + 1)))
            .collect::<Result<_>>()?;
        if values.len() != 4 {
            return Err(bad(lineno + 1));
        }
        rects.push(create_rectangle(
            &Vector2::new(values[0].min(values[2]), values[1].min(values[3])),
            &Vector2::new(values[0].max(values[2]), values[1].max(values[3])),
        ));
    }
    Ok(rects)
}
