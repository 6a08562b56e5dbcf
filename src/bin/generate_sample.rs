use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ndarray::{Array2, Array3};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

use happy_pipeline::batch::run_batch;
use happy_pipeline::data::loader::{
    write_pixels_csv, DataType, DatatypeMapping, HappyReader, HappyWriter, MemoryReader, MemoryWriter,
};
use happy_pipeline::data::normalize::{normalize_reflectance, WhiteReference};
use happy_pipeline::estimator::{run_fold, MeanBaseline};
use happy_pipeline::preprocess::{DerivativeMode, Derivative, Pca, Snv, SpectralNoiseInterpolator};
use happy_pipeline::region::ObjectRegionExtractor;
use happy_pipeline::select::SelectorSettings;
use happy_pipeline::{
    Criteria, CriteriaGroup, CriteriaOp, HappyData, HappySplitter, MetadataLayer, MetadataValue,
    PipelineConfig, PixelSelector, PreprocessorConfig, RegionExtractor, SplitSettings,
};

const HEIGHT: usize = 12;
const WIDTH: usize = 16;
const NUM_SAMPLES: usize = 12;

fn gaussian(x: f64, mu: f64, sigma: f64, amplitude: f64) -> f64 {
    amplitude * (-(x - mu).powi(2) / (2.0 * sigma.powi(2))).exp()
}

/// White/dark references of one scan.
struct References {
    white: HappyData,
    black: HappyData,
}

/// One raw scan: a round fruit on a dark belt, with its weight as target.
fn synthetic_scan(
    id: &str,
    wavelengths: &[f64],
    weight: f64,
    rng: &mut ChaCha8Rng,
) -> Result<(HappyData, References)> {
    let bands = wavelengths.len();
    let (cx, cy) = (rng.gen_range(5.0..11.0), rng.gen_range(4.0..8.0));
    let radius = rng.gen_range(2.5..4.0);
    let sugar_peak = 600.0 + 20.0 * weight;
    let sensor_noise = Normal::new(0.0, 5.0)?;

    let mut objects = Array2::zeros((HEIGHT, WIDTH));
    let mut raw = Array3::zeros((HEIGHT, WIDTH, bands));
    for y in 0..HEIGHT {
        for x in 0..WIDTH {
            let inside = ((x as f64 - cx).powi(2) + (y as f64 - cy).powi(2)).sqrt() <= radius;
            if inside {
                objects[[y, x]] = 1.0;
            }
            for (b, &wl) in wavelengths.iter().enumerate() {
                let reflectance = if inside {
                    0.3 + gaussian(wl, sugar_peak, 40.0, 0.4) + gaussian(wl, 970.0, 15.0, -0.15)
                } else {
                    0.05
                };
                let white = 4000.0 - 2.0 * x as f64;
                raw[[y, x, b]] = 100.0 + reflectance * (white - 100.0) + sensor_noise.sample(rng);
            }
        }
    }

    let mut scan = HappyData::from_cube(id, "0", raw, Some(wavelengths.to_vec()))?;
    scan.add_metadata_layer("objects", MetadataLayer::new(objects.clone()))?;
    scan.add_metadata_layer("weight", MetadataLayer::new(objects.mapv(|o| o * weight)))?;
    scan.set_global("weight", weight);
    scan.set_global("variety", if weight > 1.5 { "large" } else { "small" });

    let white = Array3::from_shape_fn((2, WIDTH, bands), |(_, x, _)| 4000.0 - 2.0 * x as f64);
    let black = Array3::from_elem((2, WIDTH, bands), 100.0);
    Ok((
        scan,
        References {
            white: HappyData::from_cube(id, "white", white, Some(wavelengths.to_vec()))?,
            black: HappyData::from_cube(id, "black", black, Some(wavelengths.to_vec()))?,
        },
    ))
}

fn default_pipeline() -> Result<PipelineConfig> {
    let criteria = CriteriaGroup::new(vec![
        Criteria::keyed(CriteriaOp::GreaterThan, "weight", MetadataValue::Integer(0))?,
        Criteria::spectral(CriteriaOp::SpectrumNotZero)?,
    ]);
    let mut settings = SelectorSettings::new(10, Some(criteria)).excluding_background();
    settings.background_key = "objects".into();
    Ok(PipelineConfig {
        normalization: Some(WhiteReference::ColumnMean),
        preprocessors: vec![
            PreprocessorConfig::SpectralNoiseInterpolator(SpectralNoiseInterpolator::default()),
            PreprocessorConfig::Snv(Snv {}),
            PreprocessorConfig::Derivative(Derivative::new(5, 2, 1, DerivativeMode::Nearest)),
            PreprocessorConfig::Pca(Pca::new(4, 50.0, Some(7))),
        ],
        selector: Some(PixelSelector::averaged_grid(settings, 1)),
        extractor: Some(RegionExtractor::Object(ObjectRegionExtractor {
            object_key: "objects".into(),
            target_name: "weight".into(),
            region_size: [8, 8],
        })),
        splits: Some(SplitSettings {
            holdout_percent: Some(20.0),
            seed: Some(42),
            ..SplitSettings::new(70.0, 10.0)
        }),
    })
}

fn main() -> Result<()> {
    env_logger::init();

    let out_dir = std::env::args()
        .nth(1)
        .map_or_else(|| PathBuf::from("sample_output"), PathBuf::from);
    std::fs::create_dir_all(&out_dir)
        .with_context(|| format!("creating {}", out_dir.display()))?;

    let config = default_pipeline()?;
    config.validate()?;
    let config_path = out_dir.join("pipeline.json");
    config.save_json(&config_path)?;

    // Build the sample set.
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let wavelengths: Vec<f64> = (0..61).map(|i| 400.0 + i as f64 * 10.0).collect();
    let mut reader = MemoryReader::new();
    let mut references: BTreeMap<String, References> = BTreeMap::new();
    for i in 0..NUM_SAMPLES {
        let id = format!("fruit_{i:02}");
        let weight = rng.gen_range(0.8..2.4);
        let (scan, mut refs) = synthetic_scan(&id, &wavelengths, weight, &mut rng)?;
        if i == NUM_SAMPLES - 1 {
            // a white reference from another camera
            let narrow = Array3::from_elem((2, WIDTH / 2, wavelengths.len()), 4000.0);
            refs.white = HappyData::from_cube(id.as_str(), "white", narrow, None)?;
        }
        reader.insert(scan);
        references.insert(id, refs);
    }

    // Per-sample pipeline.
    let mut chain = config.build_chain();
    let mut writer = MemoryWriter::new();
    let datatypes: DatatypeMapping = [("objects".to_string(), DataType::Uint8)].into();
    let ids = reader.get_sample_ids()?;
    let report = run_batch(&ids, |id| {
        let refs = references
            .get(id)
            .with_context(|| format!("no references for {id}"))?;
        let mut pixels = 0;
        let mut regions = Vec::new();
        for scan in reader.load_data(id)? {
            let normalized = match config.normalization {
                Some(mode) => normalize_reflectance(&scan, Some(&refs.white), Some(&refs.black), mode)
                    .with_context(|| format!("normalizing {id}"))?,
                None => scan,
            };
            let processed = chain.process(&normalized)?;
            if let Some(selector) = &config.selector {
                let selected = selector.select_pixels_with_rng(&processed, &mut rng);
                write_pixels_csv(
                    &out_dir.join(format!("{id}_pixels.csv")),
                    &selected,
                    processed.wavelengths(),
                )?;
                pixels += selected.len();
            }
            if let Some(extractor) = &config.extractor {
                regions.extend(extractor.extract_regions(&normalized)?);
            }
        }
        writer.write_data(&regions, Some(&datatypes))?;
        Ok((pixels, regions.len()))
    })?;
    println!("{}", report.summary());
    for (id, (pixels, regions)) in &report.outputs {
        println!("  {id}: {pixels} pixels, {regions} regions");
    }

    // Splits and one baseline fold.
    let mut splitter = HappySplitter::from_reader(out_dir.display().to_string(), &reader)?;
    if let Some(settings) = &config.splits {
        splitter.generate_splits(settings)?;
    }
    let splits_path = out_dir.join("splits.json");
    splitter.save_splits_to_json(&splits_path)?;

    let mut model = MeanBaseline::new(&reader);
    let fold = run_fold(&mut model, &splitter, 0, 0, "weight")?;
    print_fold(&fold.test_ids, &fold.prediction.predictions, fold.prediction.actuals.as_deref());

    println!(
        "Wrote {} regions, {} and {} to {}",
        writer.written.len(),
        file_name(&config_path),
        file_name(&splits_path),
        out_dir.display()
    );
    Ok(())
}

fn print_fold(ids: &[String], predictions: &[MetadataValue], actuals: Option<&[MetadataValue]>) {
    for (i, id) in ids.iter().enumerate() {
        let actual = actuals.and_then(|a| a.get(i)).cloned().unwrap_or_default();
        println!("  {id}: predicted {} actual {actual}", predictions[i]);
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
