//! Integration tests for sl1-to-photon
//!
//! These build synthetic SL1 archives on disk and run them through the
//! archive reader, the layer converter and the full pipeline.

use image::{DynamicImage, GrayImage, ImageFormat, Luma, RgbImage};
use rand::Rng;
use sl1_to_photon::{
    archive::Sl1Archive,
    config::Config,
    converter::Converter,
    error::{find_convert_error, ConvertError, Result},
    layers::{EncodedLayer, LayerConverter, LayerEncoder},
    photon::{decode_layer, PhotonSummary},
    progress::LayerProgress,
};
use std::{
    fs,
    io::{Cursor, Write},
    path::{Path, PathBuf},
    time::Duration,
};
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

const WIDTH: u32 = 1440;
const HEIGHT: u32 = 2560;

const SAMPLE_CONFIG: &str = "\
action = print
jobDir = cube
expTime = 8.0
expTimeFirst = 35.0
layerHeight = 0.05
numFade = 3
usedMaterial = 12.5
printTime = 1234.9
";

fn png_bytes(image: DynamicImage) -> Vec<u8> {
    let mut buf = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .expect("encode png");
    buf
}

/// Full-size layer whose first `index + 1` pixels are lit
fn layer_png(index: usize) -> Vec<u8> {
    let mut image = GrayImage::new(WIDTH, HEIGHT);
    for x in 0..=index as u32 {
        image.put_pixel(x, 0, Luma([255]));
    }
    png_bytes(DynamicImage::ImageLuma8(image))
}

fn thumbnail_png(width: u32, height: u32) -> Vec<u8> {
    png_bytes(DynamicImage::ImageRgb8(RgbImage::new(width, height)))
}

/// Write an SL1 archive with the given entries
fn build_archive(dir: &Path, name: &str, entries: &[(String, Vec<u8>)]) -> PathBuf {
    let path = dir.join(name);
    let mut zip = zip::ZipWriter::new(fs::File::create(&path).expect("create archive"));
    let options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for (entry, data) in entries {
        zip.start_file(entry.as_str(), options).expect("start entry");
        zip.write_all(data).expect("write entry");
    }

    zip.finish().expect("finish archive");
    path
}

/// Entries of a typical job: config, `layers` PNGs and the 800x480 preview
fn sample_entries(layers: usize) -> Vec<(String, Vec<u8>)> {
    let mut entries = vec![("config.ini".to_string(), SAMPLE_CONFIG.as_bytes().to_vec())];
    for i in 0..layers {
        entries.push((format!("cube{:05}.png", i), layer_png(i)));
    }
    entries.push((
        "thumbnail/thumbnail800x480.png".to_string(),
        thumbnail_png(800, 480),
    ));
    entries
}

fn test_config(input: PathBuf, output: PathBuf, threads: usize) -> Config {
    Config {
        input,
        output,
        force: false,
        verbose: false,
        lift_speed: 65,
        retract_speed: 150,
        threads,
        no_progress: true,
    }
}

fn convert_error(err: &anyhow::Error) -> &ConvertError {
    find_convert_error(err).unwrap_or_else(|| panic!("untyped error: {:#}", err))
}

#[test]
fn test_sample_job_conversion() {
    let dir = TempDir::new().unwrap();
    let input = build_archive(dir.path(), "cube.sl1", &sample_entries(10));
    let output = dir.path().join("cube.photon");

    let mut converter = Converter::new(test_config(input, output.clone(), 4));
    converter.run().expect("conversion should succeed");

    let stats = converter.get_conversion_stats();
    assert_eq!(stats.layer_count, 10);
    assert_eq!(stats.missing_previews, vec!["400x400".to_string()]);

    let bytes = fs::read(&output).unwrap();
    let summary = PhotonSummary::parse(&bytes).unwrap();

    assert_eq!(summary.exposure_time, 8.0);
    assert_eq!(summary.bottom_exposure_time, 35.0);
    assert_eq!(summary.layer_height, 0.05);
    assert_eq!(summary.bottom_layers, 3);
    assert_eq!(summary.print_time, 1234);
    assert_eq!(summary.layer_count, 10);
    assert_eq!(summary.high_res_preview, (800, 480));
    assert_eq!(summary.low_res_preview, (0, 0));
    assert_eq!(summary.lift_speed, 65.0);
    assert_eq!(summary.retract_speed, 150.0);
    assert_eq!(summary.volume_ml, 12.5);

    for (index, entry) in summary.layers.iter().enumerate() {
        let expected_exposure = if index < 3 { 35.0 } else { 8.0 };
        assert_eq!(entry.exposure_time, expected_exposure);

        let layer = decode_layer(summary.layer_data(&bytes, index).unwrap(), WIDTH, HEIGHT)
            .expect("layer should decode");
        let lit = layer.pixels().filter(|p| p[0] == 255).count();
        assert_eq!(lit, index + 1, "layer {} is out of order", index);

        // Rotated by 180 degrees: the lit run now ends at the bottom-right corner
        assert_eq!(layer.get_pixel(WIDTH - 1, HEIGHT - 1)[0], 255);
        assert_eq!(layer.get_pixel(0, 0)[0], 0);
    }
}

#[test]
fn test_layer_count_matches_extraction() {
    let dir = TempDir::new().unwrap();
    let mut entries = sample_entries(5);
    entries.push(("thumbnail/thumbnail400x400.png".to_string(), thumbnail_png(4, 4)));
    entries.push(("nested/extra00000.png".to_string(), layer_png(0)));
    let input = build_archive(dir.path(), "job.sl1", &entries);

    let mut archive = Sl1Archive::open(&input).unwrap();
    let scratch = dir.path().join("scratch");
    let paths = archive.extract_layers(&scratch).unwrap();

    assert_eq!(archive.count_layers(), 5);
    assert_eq!(paths.len(), 5);
    assert!(paths.iter().all(|p| p.parent() == Some(scratch.as_path())));

    let names: Vec<String> = paths
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    let mut sorted = names.clone();
    sorted.sort();
    assert_eq!(names, sorted);
    assert_eq!(names[0], "cube00000.png");

    assert_eq!(
        archive.thumbnail_labels().unwrap(),
        vec!["400x400".to_string(), "800x480".to_string()]
    );
}

#[test]
fn test_extraction_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let input = build_archive(dir.path(), "job.sl1", &sample_entries(3));
    let scratch = dir.path().join("scratch");

    let mut archive = Sl1Archive::open(&input).unwrap();
    let first = archive.extract_layers(&scratch).unwrap();
    let second = archive.extract_layers(&scratch).unwrap();
    assert_eq!(first, second);

    let mut on_disk: Vec<PathBuf> = fs::read_dir(&scratch)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    on_disk.sort();
    assert_eq!(on_disk, first);
}

#[test]
fn test_read_config_from_archive() {
    let dir = TempDir::new().unwrap();
    let input = build_archive(dir.path(), "job.sl1", &sample_entries(1));

    let config = Sl1Archive::open(&input).unwrap().read_config().unwrap();
    assert_eq!(config.len(), 8);
    assert_eq!(config["expTimeFirst"], "35.0");
    assert_eq!(config["jobDir"], "cube");
}

#[test]
fn test_thumbnail_lookup_is_exact() {
    let dir = TempDir::new().unwrap();
    let input = build_archive(dir.path(), "job.sl1", &sample_entries(1));
    let mut archive = Sl1Archive::open(&input).unwrap();

    let preview = archive.read_thumbnail("800x480").unwrap();
    assert_eq!(preview.dimensions(), (800, 480));

    let err = archive.read_thumbnail("800x48").unwrap_err();
    assert!(matches!(
        convert_error(&err),
        ConvertError::ThumbnailNotFound { label } if label == "800x48"
    ));
}

#[test]
fn test_missing_config_aborts_before_extraction() {
    let dir = TempDir::new().unwrap();
    let entries: Vec<_> = sample_entries(2)
        .into_iter()
        .filter(|(name, _)| name != "config.ini")
        .collect();
    let input = build_archive(dir.path(), "job.sl1", &entries);
    let output = dir.path().join("job.photon");

    let err = Converter::new(test_config(input, output.clone(), 2))
        .run()
        .unwrap_err();

    assert!(matches!(
        convert_error(&err),
        ConvertError::MissingConfig { .. }
    ));
    assert!(!output.exists());
}

#[test]
fn test_malformed_config_is_rejected() {
    let dir = TempDir::new().unwrap();
    let mut entries = sample_entries(1);
    entries[0].1 = b"expTime = 8.0\nthis line has no separator\n".to_vec();
    let input = build_archive(dir.path(), "job.sl1", &entries);

    let err = Sl1Archive::open(&input).unwrap().read_config().unwrap_err();
    assert!(matches!(
        convert_error(&err),
        ConvertError::ConfigParse { line: 2, .. }
    ));
}

#[test]
fn test_non_utf8_config_is_malformed() {
    let dir = TempDir::new().unwrap();
    let mut entries = sample_entries(1);
    entries[0].1 = b"expTime = 8.0\nlayerHeight = 0.05\njobDir = \xff\xfe\n".to_vec();
    let input = build_archive(dir.path(), "job.sl1", &entries);

    let err = Sl1Archive::open(&input).unwrap().read_config().unwrap_err();
    assert!(matches!(
        convert_error(&err),
        ConvertError::ConfigParse { line: 3, .. }
    ));
}

#[test]
fn test_missing_profile_key_names_the_key() {
    let dir = TempDir::new().unwrap();
    let mut entries = sample_entries(1);
    entries[0].1 = SAMPLE_CONFIG
        .lines()
        .filter(|line| !line.starts_with("numFade"))
        .collect::<Vec<_>>()
        .join("\n")
        .into_bytes();
    let input = build_archive(dir.path(), "job.sl1", &entries);
    let output = dir.path().join("job.photon");

    let err = Converter::new(test_config(input, output.clone(), 2))
        .run()
        .unwrap_err();

    assert!(matches!(
        convert_error(&err),
        ConvertError::ProfileMapping { key, .. } if key == "numFade"
    ));
    assert!(!output.exists());
}

#[test]
fn test_non_zip_input_is_rejected() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("job.sl1");
    fs::write(&input, b"definitely not a zip file").unwrap();

    let err = Sl1Archive::open(&input).err().expect("open should fail");
    assert!(matches!(convert_error(&err), ConvertError::Archive { .. }));

    let output = dir.path().join("job.photon");
    let err = Converter::new(test_config(input, output.clone(), 2))
        .run()
        .unwrap_err();
    assert!(matches!(convert_error(&err), ConvertError::Archive { .. }));
    assert!(!output.exists());
}

/// Sleeps a random time before encoding the uniform pixel value
struct JitterEncoder;

impl LayerEncoder for JitterEncoder {
    fn encode(&self, image: &GrayImage) -> Result<EncodedLayer> {
        let delay = rand::thread_rng().gen_range(0..5);
        std::thread::sleep(Duration::from_millis(delay));
        Ok(EncodedLayer::new(vec![image.get_pixel(0, 0)[0]], 0))
    }
}

#[test]
fn test_order_survives_random_completion() {
    let dir = TempDir::new().unwrap();
    let paths: Vec<PathBuf> = (0..24u8)
        .map(|i| {
            let path = dir.path().join(format!("layer{:05}.png", i));
            GrayImage::from_pixel(8, 8, Luma([i])).save(&path).unwrap();
            path
        })
        .collect();

    for workers in 1..=8 {
        let progress = LayerProgress::hidden(paths.len());
        let layers = LayerConverter::new(workers)
            .convert(&paths, &JitterEncoder, &progress)
            .unwrap();

        let order: Vec<u8> = layers.iter().map(|l| l.data()[0]).collect();
        assert_eq!(order, (0..24).collect::<Vec<u8>>(), "workers = {}", workers);
        assert_eq!(progress.completed(), paths.len());
    }
}

#[test]
fn test_single_layer_failure_writes_nothing() {
    const LAYERS: usize = 4;
    let dir = TempDir::new().unwrap();

    for failing in 0..LAYERS {
        let mut entries = sample_entries(LAYERS);
        entries[failing + 1].1 = b"corrupt layer".to_vec();
        let input = build_archive(dir.path(), &format!("broken{}.sl1", failing), &entries);

        for workers in [1, 2, 4] {
            let output = dir.path().join(format!("broken{}-{}.photon", failing, workers));
            let err = Converter::new(test_config(input.clone(), output.clone(), workers))
                .run()
                .unwrap_err();

            match convert_error(&err) {
                ConvertError::LayerConversion { index, path, .. } => {
                    assert_eq!(*index, failing);
                    assert_eq!(
                        path.file_name().unwrap().to_string_lossy(),
                        format!("cube{:05}.png", failing)
                    );
                }
                other => panic!("unexpected error: {:?}", other),
            }
            assert!(!output.exists());
        }
    }
}

#[test]
fn test_wrong_resolution_is_a_layer_error() {
    let dir = TempDir::new().unwrap();
    let mut entries = sample_entries(2);
    entries[2].1 = png_bytes(DynamicImage::ImageLuma8(GrayImage::new(10, 10)));
    let input = build_archive(dir.path(), "job.sl1", &entries);
    let output = dir.path().join("job.photon");

    let err = Converter::new(test_config(input, output.clone(), 2))
        .run()
        .unwrap_err();

    assert!(matches!(
        convert_error(&err),
        ConvertError::LayerConversion { index: 1, .. }
    ));
    assert!(!output.exists());
}

#[test]
fn test_existing_output_requires_force() {
    let dir = TempDir::new().unwrap();
    let input = build_archive(dir.path(), "job.sl1", &sample_entries(2));
    let output = dir.path().join("job.photon");
    fs::write(&output, b"previous job").unwrap();

    let err = Converter::new(test_config(input.clone(), output.clone(), 2))
        .run()
        .unwrap_err();
    match convert_error(&err) {
        ConvertError::OutputCollision { path } => assert_eq!(path, &output),
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(fs::read(&output).unwrap(), b"previous job");

    let mut config = test_config(input, output.clone(), 2);
    config.force = true;
    Converter::new(config).run().expect("forced conversion");

    let summary = PhotonSummary::parse(&fs::read(&output).unwrap()).unwrap();
    assert_eq!(summary.layer_count, 2);
}

#[test]
fn test_cli_arguments_drive_profile() {
    let dir = TempDir::new().unwrap();
    let input = build_archive(dir.path(), "job.sl1", &sample_entries(1));

    let config = Config::parse_from([
        "sl1-to-photon".into(),
        input.clone().into_os_string(),
        "-ls".into(),
        "90".into(),
        "-rs".into(),
        "110".into(),
        "-j".into(),
        "2".into(),
    ])
    .unwrap();
    assert_eq!(config.output, dir.path().join("job.photon"));

    let output = config.output.clone();
    Converter::new(config).run().unwrap();

    let summary = PhotonSummary::parse(&fs::read(&output).unwrap()).unwrap();
    assert_eq!(summary.lift_speed, 90.0);
    assert_eq!(summary.retract_speed, 110.0);
}
