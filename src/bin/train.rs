//! Train a cascade of regressors from an annotated landmark database.
//!
//! Usage:
//!   train <database-dir> -o tracker.bin
//!   train <database-dir> --rectangles rects.csv --num-cascades 10 --num-trees 500

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use serde::Deserialize;

use shapetrack::database::{load_database, ImportParameters, IBUG_68_MIRROR};
use shapetrack::{
    InputData, SampleCreationParameters, SampleData, Tracker, TrainingParameters,
};

#[derive(Parser, Debug)]
#[command(name = "train")]
#[command(version, about = "Train a shape tracker from a landmark database", long_about = None)]
struct Args {
    /// Database directory: images with sibling .pts landmark files.
    database: PathBuf,

    /// CSV of initial detection rectangles, one x0 y0 x1 y1 line per image.
    /// Defaults to each shape's bounding box.
    #[arg(long)]
    rectangles: Option<PathBuf>,

    /// Trained tracker output file.
    #[arg(short, long, default_value = "tracker.bin")]
    output: PathBuf,

    /// JSON file with training and sample-creation parameters; command-line
    /// flags are ignored when given.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Seed for the training random number generator.
    #[arg(long, default_value = "10")]
    seed: u64,

    /// Number of cascades to train.
    #[arg(long, default_value = "10")]
    num_cascades: usize,

    /// Number of trees per cascade.
    #[arg(long, default_value = "500")]
    num_trees: usize,

    /// Maximum tree depth.
    #[arg(long, default_value = "5")]
    max_depth: usize,

    /// Number of random pixel coordinates per cascade.
    #[arg(long, default_value = "400")]
    num_pixels: usize,

    /// Number of random split tests at each tree node.
    #[arg(long, default_value = "20")]
    num_splits: usize,

    /// Prior that favors closer pixel coordinate pairs.
    #[arg(long, default_value = "0.1")]
    lambda: f32,

    /// Learning rate of each tree.
    #[arg(long, default_value = "0.08")]
    learning_rate: f32,

    /// Margin added to the mean-shape bounding box when sampling pixels.
    #[arg(long, default_value = "0.05")]
    expansion: f32,

    /// Number of perturbed shapes generated per image.
    #[arg(long, default_value = "20")]
    shapes_per_image: usize,

    /// Lower bound of the blend weight interval.
    #[arg(long, default_value = "0.65")]
    blend_min: f32,

    /// Upper bound of the blend weight interval.
    #[arg(long, default_value = "0.8")]
    blend_max: f32,

    /// Skip the extra mean-shape sample per image.
    #[arg(long)]
    no_mean_shape_sample: bool,

    /// Additionally mirror every image, shape and rectangle horizontally
    /// (68-point ibug annotation scheme).
    #[arg(long)]
    mirror: bool,

    /// Downscale images whose longer side exceeds this many pixels.
    #[arg(long, default_value = "2048")]
    load_max_size: u32,
}

#[derive(Deserialize)]
struct ConfigFile {
    training: TrainingParameters,
    creation: SampleCreationParameters,
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

fn parameters(args: &Args) -> Result<(TrainingParameters, SampleCreationParameters), Box<dyn std::error::Error>> {
    if let Some(config) = &args.config {
        let text = std::fs::read_to_string(config)?;
        let parsed: ConfigFile = serde_json::from_str(&text)?;
        return Ok((parsed.training, parsed.creation));
    }

    Ok((
        TrainingParameters {
            num_cascades: args.num_cascades,
            num_trees: args.num_trees,
            max_tree_depth: args.max_depth,
            num_random_pixel_coordinates: args.num_pixels,
            num_random_split_tests_per_node: args.num_splits,
            exponential_lambda: args.lambda,
            learning_rate: args.learning_rate,
            expansion_random_pixel_coordinates: args.expansion,
        },
        SampleCreationParameters {
            num_shapes_per_image: args.shapes_per_image,
            linear_weight_range: (args.blend_min, args.blend_max),
            include_mean_shape: !args.no_mean_shape_sample,
        },
    ))
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let (training, creation) = parameters(args)?;

    let import = ImportParameters {
        max_image_side_length: Some(args.load_max_size),
    };
    let (images, shapes, rects) = load_database(&args.database, args.rectangles.as_deref(), &import)?;
    eprintln!("Loaded {} annotated images", images.len());

    let mut input = InputData::new(images, shapes, rects, args.seed)?;
    if args.mirror {
        input.mirror_horizontally(&IBUG_68_MIRROR)?;
        eprintln!("Mirrored corpus to {} images", input.len());
    }
    input.normalize_shapes()?;

    let mut samples = SampleData::create_training_samples(&mut input, &creation, training)?;
    eprintln!("Created {} training samples", samples.samples.len());

    let tracker = Tracker::fit(&mut input, &mut samples)?;

    tracker.save(&args.output)?;
    eprintln!("Saved tracker to {}", args.output.display());
    Ok(())
}
