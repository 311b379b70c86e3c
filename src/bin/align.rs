//! Align a trained shape tracker to an image and export the landmarks.
//!
//! The initial region comes either from a face detector model or from an
//! explicit `--rect x,y,w,h`. Landmarks are written as a numeric matrix
//! (CSV, one `x,y` row per landmark) or as JSON.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use image::GenericImageView;
use nalgebra::Vector2;
use rustface::{Detector, ImageData};
use serde::Serialize;

use shapetrack::{
    create_rectangle, estimate_similarity_transform, lift_rect, unit_rectangle, Error, Image,
    Rect, Tracker,
};

#[derive(Parser, Debug)]
#[command(name = "align")]
#[command(version, about = "Predict landmarks on an image with a trained tracker", long_about = None)]
struct Args {
    /// Input image file.
    image: PathBuf,

    /// Trained tracker file.
    #[arg(short, long, default_value = "tracker.bin")]
    tracker: PathBuf,

    /// Face detector model; used when no --rect is given.
    #[arg(long, default_value = "seeta_fd_frontal_v1.0.bin")]
    detector: PathBuf,

    /// Initial region as x,y,w,h, bypassing detection.
    #[arg(long, value_delimiter = ',', num_args = 4)]
    rect: Option<Vec<f32>>,

    /// Minimum face size for detection.
    #[arg(long, default_value = "40")]
    min_face_size: u32,

    /// Output file (default: stdout).
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Output as JSON instead of CSV.
    #[arg(long)]
    json: bool,

    /// Show verbose output.
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Serialize)]
struct Output {
    image: String,
    landmark_count: usize,
    landmarks: Vec<[f32; 2]>,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn detect_rect(args: &Args, gray: &[u8], width: u32, height: u32) -> Result<Rect, Error> {
    if let Some(values) = &args.rect {
        let (x, y, w, h) = (values[0], values[1], values[2], values[3]);
        return Ok(create_rectangle(
            &Vector2::new(x, y),
            &Vector2::new(x + w, y + h),
        ));
    }

    let path = args
        .detector
        .to_str()
        .ok_or_else(|| Error::FormatInvalid("detector path is not valid UTF-8".into()))?;
    let mut detector = rustface::create_detector(path)
        .map_err(|e| Error::FormatInvalid(format!("failed to load face detector: {e}")))?;
    detector.set_min_face_size(args.min_face_size);
    detector.set_score_thresh(2.0);
    detector.set_pyramid_scale_factor(0.8);
    detector.set_slide_window_step(4, 4);

    let image_data = ImageData::new(gray, width, height);
    let faces = detector.detect(&image_data);
    if args.verbose {
        eprintln!("Found {} face(s)", faces.len());
    }

    // Track the most prominent detection.
    let best = faces
        .iter()
        .max_by_key(|f| f.bbox().width() * f.bbox().height())
        .ok_or(Error::DetectionMissing)?;
    let bbox = best.bbox();
    Ok(create_rectangle(
        &Vector2::new(bbox.x() as f32, bbox.y() as f32),
        &Vector2::new(
            bbox.x() as f32 + bbox.width() as f32,
            bbox.y() as f32 + bbox.height() as f32,
        ),
    ))
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    if args.verbose {
        eprintln!("Loading tracker from {}", args.tracker.display());
    }
    let tracker = Tracker::load(&args.tracker)?;

    let decoded = image::open(&args.image)?;
    let (width, height) = decoded.dimensions();
    let luma = decoded.to_luma8();
    let gray = Image::from_luma8(width as usize, height as usize, luma.as_raw());

    let rect = detect_rect(args, luma.as_raw(), width, height)?;

    // The canonical frame maps the detection rectangle onto the unit
    // rectangle; prediction needs the inverse direction.
    let to_canonical = estimate_similarity_transform(&lift_rect(&rect), &lift_rect(&unit_rectangle()));
    let shape_to_image = to_canonical
        .try_inverse()
        .ok_or(Error::RankDeficientTransform)?;

    let landmarks = tracker.predict(&gray, &shape_to_image, None);
    if args.verbose {
        eprintln!("Predicted {} landmarks", landmarks.ncols());
    }

    let output_str = if args.json {
        let out = Output {
            image: args.image.display().to_string(),
            landmark_count: landmarks.ncols(),
            landmarks: (0..landmarks.ncols())
                .map(|i| [landmarks[(0, i)], landmarks[(1, i)]])
                .collect(),
        };
        serde_json::to_string_pretty(&out)?
    } else {
        let mut s = String::new();
        for i in 0..landmarks.ncols() {
            s.push_str(&format!("{},{}\n", landmarks[(0, i)], landmarks[(1, i)]));
        }
        s
    };

    match &args.output {
        Some(path) => std::fs::write(path, &output_str)?,
        None => print!("{output_str}"),
    }
    Ok(())
}
