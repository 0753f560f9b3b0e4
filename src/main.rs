use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::builder::PossibleValuesParser;
use clap::error::ErrorKind;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use log::{error, LevelFilter};

use gis_ingest::consistency::DEFAULT_TOLERANCE;
use gis_ingest::{process_files, GeometryType, IngestConfig, IngestError, OutputFormat, SourceFormat, Status};

fn cli() -> Command {
    Command::new("gis-ingest")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Jesper Fjellin")
        .about("Ingests GeoJSON, Shapefile and KML data into one repaired, georeferenced output")
        .arg(
            Arg::new("input")
                .short('i')
                .long("input")
                .num_args(1..)
                .required(true)
                .value_parser(value_parser!(PathBuf))
                .help("Input files or directories"),
        )
        .arg(
            Arg::new("type")
                .short('t')
                .long("type")
                .required(true)
                .value_parser(["geojson", "shp", "kml"])
                .help("Output format"),
        )
        .arg(
            Arg::new("filename")
                .short('f')
                .long("filename")
                .required(true)
                .help("Output file name, without extension"),
        )
        .arg(
            Arg::new("output-dir")
                .short('o')
                .long("output-dir")
                .value_parser(value_parser!(PathBuf))
                .help("Output directory (default: 'output' next to the first input)"),
        )
        .arg(
            Arg::new("input-type")
                .long("input-type")
                .default_value("all")
                .value_parser(["geojson", "shp", "kml", "zip", "all"])
                .help("Only pick up inputs of this type"),
        )
        .arg(
            Arg::new("geometry-type")
                .short('g')
                .long("geometry-type")
                .ignore_case(true)
                .value_parser(PossibleValuesParser::new(["Point", "LineString", "Polygon"]))
                .help("Keep only Point, LineString or Polygon features"),
        )
        .arg(
            Arg::new("boundary")
                .short('b')
                .long("boundary")
                .value_parser(value_parser!(PathBuf))
                .help("Reference boundary layer to check the data against"),
        )
        .arg(
            Arg::new("tolerance")
                .long("tolerance")
                .value_parser(value_parser!(f64))
                .help("Allowed distance in metres between feature ends and the boundary (default 20)"),
        )
        .arg(
            Arg::new("clip")
                .long("clip")
                .action(ArgAction::SetTrue)
                .requires("boundary")
                .help("Clip the output to the boundary"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count)
                .help("More output per occurrence"),
        )
}

fn build_config(matches: &ArgMatches, inputs: &[PathBuf]) -> Result<IngestConfig> {
    let output_format: OutputFormat = matches
        .get_one::<String>("type")
        .context("missing output type")?
        .parse()?;

    let input_types = match matches.get_one::<String>("input-type").map(String::as_str) {
        None | Some("all") => IngestConfig::default().input_types,
        Some(extension) => vec![SourceFormat::from_extension(extension)
            .with_context(|| format!("unknown input type '{extension}'"))?],
    };

    let geometry_type = matches
        .get_one::<String>("geometry-type")
        .map(|name| name.parse::<GeometryType>())
        .transpose()?;

    let output_dir = match matches.get_one::<PathBuf>("output-dir") {
        Some(dir) => dir.clone(),
        None => default_output_dir(inputs),
    };

    Ok(IngestConfig {
        input_types,
        geometry_type,
        output_format,
        output_dir,
        output_stem: matches
            .get_one::<String>("filename")
            .context("missing output file name")?
            .clone(),
        boundary: matches.get_one::<PathBuf>("boundary").cloned(),
        tolerance: matches
            .get_one::<f64>("tolerance")
            .copied()
            .unwrap_or(DEFAULT_TOLERANCE),
        clip_to_boundary: matches.get_flag("clip"),
        ..IngestConfig::default()
    })
}

fn default_output_dir(inputs: &[PathBuf]) -> PathBuf {
    let base = match inputs.first() {
        Some(first) if first.is_dir() => first.as_path(),
        Some(first) => first.parent().unwrap_or_else(|| Path::new(".")),
        None => Path::new("."),
    };
    base.join("output")
}

fn run(matches: &ArgMatches) -> Result<Status> {
    let inputs: Vec<PathBuf> = matches
        .get_many::<PathBuf>("input")
        .context("missing input")?
        .cloned()
        .collect();

    let config = build_config(matches, &inputs)?;
    let outcome = process_files(&inputs, config).context("ingestion failed")?;

    for skipped in &outcome.skipped {
        eprintln!("skipped {}: {}", skipped.path.display(), skipped.reason);
    }
    if let Some(points) = &outcome.inconsistent_points {
        eprintln!("inconsistent points written to {}", points.display());
    }
    Ok(outcome.status)
}

/// Help and version requests exit as clap intends. Usage errors are an
/// unhandled failure like any other and report status 0, so they never
/// look like the pipeline's invalid-input status.
fn parse_args() -> std::result::Result<ArgMatches, Status> {
    cli().try_get_matches().map_err(|e| {
        let _ = e.print();
        match e.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => std::process::exit(0),
            _ => Status::Failure,
        }
    })
}

fn main() {
    let matches = match parse_args() {
        Ok(matches) => matches,
        Err(status) => {
            println!("{}", status.code());
            std::process::exit(status.code());
        }
    };

    let level = match matches.get_count("verbose") {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp(None)
        .init();

    let status = match run(&matches) {
        Ok(status) => status,
        Err(e) => {
            error!("{e:#}");
            match e.downcast_ref::<IngestError>() {
                Some(ingest) => Status::from_error(ingest),
                None => Status::Failure,
            }
        }
    };

    println!("{}", status.code());
    std::process::exit(status.code());
}
