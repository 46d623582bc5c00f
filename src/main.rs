//! Command line calibration tool.
//!
//! Reads 3D/2D correspondences from a CSV file (one `xw,yw,zw,xf,yf` record
//! per line, world coordinates in millimetres, image coordinates in pixels),
//! runs the selected Tsai calibration and prints the recovered camera
//! parameters as YAML or JSON together with accuracy statistics.
//!
//! Usage:
//! ```bash
//! cargo run -- points.csv --target coplanar --optimization full \
//!   --image-dim 640x480
//! cargo run -- points.csv --target noncoplanar --model sony-xc75-matrox
//! ```

use clap::Parser;
use log::info;
use nalgebra::Vector3;
use std::path::PathBuf;

use tsai_tools::calibration::eval;
use tsai_tools::calibration::{calibrate_named, Correspondence};
use tsai_tools::camera::{CameraParameters, KnownCamera};

/// Tsai camera calibration from a correspondence file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// CSV file with one xw,yw,zw,xf,yf correspondence per line
    data: PathBuf,

    /// Calibration target type (coplanar, noncoplanar)
    #[arg(short = 't', long, default_value = "coplanar")]
    target: String,

    /// Optimization type (three-param, full)
    #[arg(short = 'o', long, default_value = "full")]
    optimization: String,

    /// Known camera model preset, e.g. sony-xc75-matrox
    #[arg(short = 'm', long, conflicts_with_all = ["camera_file", "image_dim"])]
    model: Option<String>,

    /// YAML file with the fixed sensor geometry
    #[arg(short = 'c', long, conflicts_with = "image_dim")]
    camera_file: Option<PathBuf>,

    /// Derive a synthetic camera from image dimensions, e.g. 640x480
    #[arg(short = 'd', long)]
    image_dim: Option<String>,

    /// Origin offset added to all world coordinates, e.g. 0,0,100
    #[arg(long)]
    offset: Option<String>,

    /// Output format for the calibrated parameters (yaml, json)
    #[arg(short = 'f', long, default_value = "yaml")]
    format: String,

    /// Also write the calibrated parameters to this YAML file
    #[arg(long)]
    output: Option<PathBuf>,
}

fn load_correspondences(path: &PathBuf) -> Result<Vec<Correspondence>, Box<dyn std::error::Error>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .trim(csv::Trim::All)
        .comment(Some(b'#'))
        .from_path(path)?;

    let mut points = Vec::new();
    for record in reader.deserialize() {
        let point: Correspondence = record?;
        points.push(point);
    }
    Ok(points)
}

fn parse_image_dim(spec: &str) -> Result<(f64, f64), Box<dyn std::error::Error>> {
    let parts: Vec<&str> = spec.split('x').collect();
    if parts.len() != 2 {
        return Err(format!("invalid image dimensions '{}', expected WxH", spec).into());
    }
    Ok((parts[0].parse()?, parts[1].parse()?))
}

fn parse_offset(spec: &str) -> Result<Vector3<f64>, Box<dyn std::error::Error>> {
    let parts: Vec<&str> = spec.split(',').collect();
    if parts.len() != 3 {
        return Err(format!("invalid origin offset '{}', expected x,y,z", spec).into());
    }
    Ok(Vector3::new(
        parts[0].parse()?,
        parts[1].parse()?,
        parts[2].parse()?,
    ))
}

fn initial_parameters(cli: &Cli) -> Result<CameraParameters, Box<dyn std::error::Error>> {
    if let Some(name) = &cli.model {
        let model: KnownCamera = name.parse()?;
        info!("using camera model preset {}", model.name());
        return Ok(CameraParameters::from_model(model));
    }
    if let Some(path) = &cli.camera_file {
        info!("loading sensor geometry from {}", path.display());
        return Ok(CameraParameters::load_from_yaml(
            path.to_str().ok_or("camera file path is not valid UTF-8")?,
        )?);
    }
    if let Some(spec) = &cli.image_dim {
        let (width, height) = parse_image_dim(spec)?;
        return Ok(CameraParameters::from_image_dim(width, height));
    }
    Err("one of --model, --camera-file or --image-dim is required".into())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    let points = load_correspondences(&cli.data)?;
    info!(
        "loaded {} correspondences from {}",
        points.len(),
        cli.data.display()
    );

    let initial = initial_parameters(&cli)?;
    let offset = cli.offset.as_deref().map(parse_offset).transpose()?;

    let result = calibrate_named(&cli.target, &cli.optimization, &points, &initial, offset)?;
    if !result.converged {
        eprintln!(
            "warning: calibration did not converge after {} iterations; \
             the reported parameters are the best found",
            result.iterations
        );
    }

    let cp = &result.parameters;
    info!(
        "calibrated f = {:.4}, kappa1 = {:.6e}, T = ({:.3}, {:.3}, {:.3})",
        cp.f, cp.kappa1, cp.tx, cp.ty, cp.tz
    );
    info!("horizontal field of view: {:.3} deg", cp.fovx().to_degrees());

    let image_error = eval::distorted_image_plane_error(cp, &points)?;
    let object_error = eval::object_space_error(cp, &points);
    let (nce_mean, nce_stddev) = eval::normalized_calibration_error(cp, &points)?;
    eprintln!(
        "image plane error [pix]: mean {:.4}, stddev {:.4}, max {:.4}",
        image_error.mean, image_error.stddev, image_error.max
    );
    eprintln!(
        "object space error [mm]: mean {:.4}, stddev {:.4}, max {:.4}",
        object_error.mean, object_error.stddev, object_error.max
    );
    eprintln!(
        "normalized calibration error: {:.4} +/- {:.4}",
        nce_mean, nce_stddev
    );

    match cli.format.as_str() {
        "yaml" => print!("{}", serde_yaml::to_string(cp)?),
        "json" => println!("{}", serde_json::to_string_pretty(cp)?),
        other => return Err(format!("unsupported output format: {}", other).into()),
    }

    if let Some(path) = &cli.output {
        cp.save_to_yaml(path.to_str().ok_or("output path is not valid UTF-8")?)?;
        info!("saved calibrated parameters to {}", path.display());
    }

    Ok(())
}
