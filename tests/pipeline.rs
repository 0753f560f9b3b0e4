use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use geo::{polygon, Geometry};
use gis_ingest::formats::shapefile::{prj_wkt, write_shapefile};
use gis_ingest::{
    process_file, Crs, FileState, IngestConfig, MemoryReporter, OutputFormat, Pipeline, Record,
    Status, VectorDataset,
};
use serde_json::{json, Map, Value};
use zip::write::SimpleFileOptions;

const FARM: &str = r#"{"type":"FeatureCollection","features":[{"type":"Feature","properties":{"farm":"A"},"geometry":{"type":"Polygon","coordinates":[[[-54.31,-15.41],[-54.29,-15.41],[-54.29,-15.39],[-54.31,-15.39],[-54.31,-15.41]]]}}]}"#;

fn config_in(dir: &Path) -> IngestConfig {
    IngestConfig {
        output_dir: dir.join("output"),
        output_stem: "merged".to_string(),
        ..IngestConfig::default()
    }
}

fn terrace(end_lat: f64) -> String {
    json!({
        "type": "FeatureCollection",
        "features": [{
            "type": "Feature",
            "properties": { "terrace": 1 },
            "geometry": {
                "type": "LineString",
                "coordinates": [[-54.30, -15.40995], [-54.30, end_lat]]
            }
        }]
    })
    .to_string()
}

fn zip_files(zip_path: &Path, members: &[(&str, &[u8])]) {
    let mut zip = zip::ZipWriter::new(File::create(zip_path).unwrap());
    for (name, content) in members {
        zip.start_file(name.to_string(), SimpleFileOptions::default())
            .unwrap();
        zip.write_all(content).unwrap();
    }
    zip.finish().unwrap();
}

/// Zips a one-record polygon shapefile under `prefix` inside the archive.
fn shapefile_archive(dir: &Path, prefix: &str) -> PathBuf {
    let staging = dir.join("staging");
    fs::create_dir_all(&staging).unwrap();
    let mut dataset = VectorDataset::new(Crs::WGS84);
    let mut attributes = Map::new();
    attributes.insert("name".into(), json!("plot"));
    dataset.push(Record::new(
        Geometry::Polygon(polygon![
            (x: -54.31, y: -15.41), (x: -54.29, y: -15.41), (x: -54.29, y: -15.39)
        ]),
        attributes,
    ));
    write_shapefile(&dataset, &staging.join("area.shp")).unwrap();
    fs::write(staging.join("area.prj"), prj_wkt(&Crs::WGS84).unwrap()).unwrap();

    let contents: Vec<(String, Vec<u8>)> = ["shp", "shx", "dbf", "prj"]
        .iter()
        .map(|ext| {
            (
                format!("{prefix}area.{ext}"),
                fs::read(staging.join(format!("area.{ext}"))).unwrap(),
            )
        })
        .collect();
    let members: Vec<(&str, &[u8])> = contents
        .iter()
        .map(|(name, bytes)| (name.as_str(), bytes.as_slice()))
        .collect();

    let zip_path = dir.join("7.zip");
    zip_files(&zip_path, &members);
    fs::remove_dir_all(&staging).unwrap();
    zip_path
}

fn leftover_scratch_dirs(output_dir: &Path) -> usize {
    fs::read_dir(output_dir)
        .unwrap()
        .filter(|entry| {
            entry
                .as_ref()
                .unwrap()
                .file_name()
                .to_string_lossy()
                .starts_with('.')
        })
        .count()
}

#[test]
fn nested_shapefile_archive_is_ingested() {
    let dir = tempfile::tempdir().unwrap();
    let zip_path = shapefile_archive(dir.path(), "export/2023/plots/");

    let reporter = MemoryReporter::new();
    let outcome = Pipeline::new(config_in(dir.path()), &reporter)
        .run(&[zip_path])
        .unwrap();

    assert_eq!(outcome.status, Status::Success);
    assert_eq!(outcome.records, 1);
    let output = outcome.output.unwrap();
    assert_eq!(output, dir.path().join("output/merged.geojson"));

    let written: Value = serde_json::from_str(&fs::read_to_string(&output).unwrap()).unwrap();
    assert_eq!(written["features"][0]["properties"]["name"], json!("plot"));
    assert!(reporter.states_of("7.zip").contains(&FileState::Extracting));
    assert_eq!(leftover_scratch_dirs(&dir.path().join("output")), 0);
}

#[test]
fn archive_with_two_candidates_is_invalid_input() {
    let dir = tempfile::tempdir().unwrap();
    let zip_path = dir.path().join("bundle.zip");
    zip_files(
        &zip_path,
        &[
            ("data/1.geojson", FARM.as_bytes()),
            ("data/2.geojson", FARM.as_bytes()),
        ],
    );

    let reporter = MemoryReporter::new();
    let outcome = Pipeline::new(config_in(dir.path()), &reporter)
        .run(&[zip_path])
        .unwrap();

    assert_eq!(outcome.status, Status::InvalidInput);
    assert_eq!(outcome.status.code(), 2);
    assert!(outcome.output.is_none());
    assert_eq!(reporter.states_of("bundle.zip").last(), Some(&FileState::Invalid));
    assert_eq!(leftover_scratch_dirs(&dir.path().join("output")), 0);
}

#[test]
fn files_merge_in_numeric_order() {
    let dir = tempfile::tempdir().unwrap();
    for (name, id) in [("plot_10.geojson", 10), ("plot_2.geojson", 2), ("plot_1.geojson", 1)] {
        let body = FARM.replace("\"A\"", &format!("{id}"));
        fs::write(dir.path().join(name), body).unwrap();
    }

    let outcome = Pipeline::new(config_in(dir.path()), &MemoryReporter::new())
        .run(&[dir.path().to_path_buf()])
        .unwrap();
    let written: Value =
        serde_json::from_str(&fs::read_to_string(outcome.output.unwrap()).unwrap()).unwrap();
    let farms: Vec<_> = written["features"]
        .as_array()
        .unwrap()
        .iter()
        .map(|feature| feature["properties"]["farm"].clone())
        .collect();
    assert_eq!(farms, [json!(1), json!(2), json!(10)]);
}

#[test]
fn terrace_end_outside_boundary_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let boundary = dir.path().join("farm.geojson");
    fs::write(&boundary, FARM).unwrap();
    let input = dir.path().join("terraces");
    fs::create_dir_all(&input).unwrap();
    // about 25 m north of the boundary's northern edge
    fs::write(input.join("1.geojson"), terrace(-15.38977)).unwrap();

    let config = IngestConfig {
        boundary: Some(boundary),
        ..config_in(dir.path())
    };
    let outcome = Pipeline::new(config, &MemoryReporter::new())
        .run(&[input])
        .unwrap();

    assert_eq!(outcome.status, Status::Warnings);
    let points_path = outcome.inconsistent_points.unwrap();
    assert_eq!(points_path, dir.path().join("output/inconsistent_points.geojson"));

    let points: Value = serde_json::from_str(&fs::read_to_string(points_path).unwrap()).unwrap();
    let features = points["features"].as_array().unwrap();
    assert_eq!(features.len(), 1);
    let coordinates = &features[0]["geometry"]["coordinates"];
    assert!((coordinates[0].as_f64().unwrap() + 54.30).abs() < 1e-6);
    assert!((coordinates[1].as_f64().unwrap() + 15.38977).abs() < 1e-6);
}

#[test]
fn terrace_within_tolerance_is_a_plain_success() {
    let dir = tempfile::tempdir().unwrap();
    let boundary = dir.path().join("farm.geojson");
    fs::write(&boundary, FARM).unwrap();
    let input = dir.path().join("1.geojson");
    // about 5 m past the edge
    fs::write(&input, terrace(-15.38995)).unwrap();

    let config = IngestConfig {
        boundary: Some(boundary),
        ..config_in(dir.path())
    };
    let outcome = Pipeline::new(config, &MemoryReporter::new())
        .run(&[input])
        .unwrap();
    assert_eq!(outcome.status, Status::Success);
    assert!(outcome.inconsistent_points.is_none());
}

#[test]
fn data_outside_the_boundary_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let boundary = dir.path().join("farm.geojson");
    fs::write(&boundary, FARM).unwrap();
    let input = dir.path().join("1.geojson");
    let far_away = r#"{"type":"LineString","coordinates":[[-50.0,-10.0],[-50.001,-10.0]]}"#;
    fs::write(&input, far_away).unwrap();

    let config = IngestConfig {
        boundary: Some(boundary),
        ..config_in(dir.path())
    };
    let error = Pipeline::new(config, &MemoryReporter::new())
        .run(&[input])
        .unwrap_err();
    assert_eq!(Status::from_error(&error), Status::InvalidInput);
}

#[test]
fn clipping_cuts_output_to_the_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let boundary = dir.path().join("farm.geojson");
    fs::write(&boundary, FARM).unwrap();
    let input = dir.path().join("1.geojson");
    fs::write(&input, terrace(-15.38977)).unwrap();

    let config = IngestConfig {
        boundary: Some(boundary),
        clip_to_boundary: true,
        output_format: OutputFormat::Kml,
        ..config_in(dir.path())
    };
    let outcome = Pipeline::new(config, &MemoryReporter::new())
        .run(&[input])
        .unwrap();
    assert_eq!(outcome.status, Status::Warnings);

    let clipped = process_file(&outcome.output.unwrap(), 1).unwrap();
    let Geometry::LineString(line) = &clipped.records[0].geometry else {
        panic!("expected a line");
    };
    let north = line.0.iter().map(|c| c.y).fold(f64::MIN, f64::max);
    assert!(north <= -15.39 + 1e-9);
    assert!(outcome
        .inconsistent_points
        .unwrap()
        .extension()
        .is_some_and(|ext| ext == "kml"));
}

#[test]
fn shapefile_output_is_a_zip_bundle() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("3.geojson");
    fs::write(&input, FARM).unwrap();

    let config = IngestConfig {
        output_format: OutputFormat::Shapefile,
        ..config_in(dir.path())
    };
    let outcome = Pipeline::new(config, &MemoryReporter::new())
        .run(&[input])
        .unwrap();
    let bundle = outcome.output.unwrap();
    assert_eq!(bundle, dir.path().join("output/merged.zip"));

    let reread = process_file(&bundle, 2).unwrap();
    assert_eq!(reread.crs, Crs::WGS84);
    assert_eq!(reread.len(), 1);
    assert_eq!(reread.records[0].attributes["farm"], json!("A"));
}
