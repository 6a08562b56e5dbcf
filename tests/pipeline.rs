use std::collections::BTreeSet;

use ndarray::{Array2, Array3};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use happy_pipeline::batch::run_batch;
use happy_pipeline::data::loader::{HappyReader, MemoryReader};
use happy_pipeline::data::normalize::{normalize_reflectance, WhiteReference};
use happy_pipeline::estimator::{run_fold, MeanBaseline};
use happy_pipeline::preprocess::{Crop, Snv, WavelengthSubset};
use happy_pipeline::region::GridRegionExtractor;
use happy_pipeline::select::SelectorSettings;
use happy_pipeline::{
    Criteria, CriteriaGroup, CriteriaOp, HappyData, HappyError, HappySplitter, MetadataLayer,
    MetadataValue, PipelineConfig, PixelSelector, PreprocessorConfig, RegionExtractor,
    SplitSettings,
};

/// 6x8 scans with 10 bands; left half is class 1, right half class 2.
fn scan(i: usize) -> HappyData {
    let cube = Array3::from_shape_fn((6, 8, 10), |(y, x, b)| {
        200.0 + (i * 10 + y + x) as f64 + if x < 4 { b as f64 * 30.0 } else { 300.0 - b as f64 * 20.0 }
    });
    let wavelengths = (0..10).map(|b| 500.0 + b as f64 * 25.0).collect();
    let mut hd = HappyData::from_cube(format!("s{i}"), "0", cube, Some(wavelengths)).unwrap();
    let classes = Array2::from_shape_fn((6, 8), |(_, x)| if x < 4 { 1.0 } else { 2.0 });
    hd.add_metadata_layer("class", MetadataLayer::new(classes)).unwrap();
    hd.set_global("firmness", 1.0 + i as f64);
    hd
}

fn reader(n: usize) -> MemoryReader {
    (0..n).map(scan).collect()
}

fn white_for(data: &HappyData) -> HappyData {
    let white = Array3::from_elem((1, data.width(), data.num_bands()), 2000.0);
    HappyData::from_cube(data.sample_id(), "white", white, None).unwrap()
}

fn config() -> PipelineConfig {
    let criteria = CriteriaGroup::new(vec![
        Criteria::keyed(CriteriaOp::In, "class", MetadataValue::List(vec![MetadataValue::Integer(2)]))
            .unwrap(),
        Criteria::spectral(CriteriaOp::SpectrumNotZero).unwrap(),
    ]);
    PipelineConfig {
        normalization: Some(WhiteReference::ColumnMean),
        preprocessors: vec![
            PreprocessorConfig::WavelengthSubset(WavelengthSubset::new(vec![2, 3, 4, 5, 6, 7])),
            PreprocessorConfig::Snv(Snv {}),
            PreprocessorConfig::Crop(Crop::new(2, 1, 6, 4)),
        ],
        selector: Some(PixelSelector::simple(SelectorSettings::new(8, Some(criteria)))),
        extractor: Some(RegionExtractor::Grid(GridRegionExtractor {
            region_size: [3, 2],
            truncate_regions: false,
        })),
        splits: Some(SplitSettings {
            holdout_percent: Some(20.0),
            seed: Some(9),
            ..SplitSettings::new(75.0, 25.0)
        }),
    }
}

#[test]
fn end_to_end_on_synthetic_samples() {
    let reader = reader(10);
    let config = config();
    config.validate().unwrap();
    let mut chain = config.build_chain();
    let mut rng = ChaCha8Rng::seed_from_u64(4);

    for id in reader.get_sample_ids().unwrap() {
        for raw in reader.load_data(&id).unwrap() {
            let white = white_for(&raw);
            let normalized = normalize_reflectance(&raw, Some(&white), None, WhiteReference::ColumnMean).unwrap();
            let processed = chain.process(&normalized).unwrap();

            assert_eq!(processed.shape(), [4, 6, 6]);
            assert_eq!(processed.wavelengths().unwrap()[0], 550.0);
            // layers follow the crop
            assert_eq!(processed.metadata_dict()["class"].data.dim(), (4, 6));

            let pixels = config
                .selector
                .as_ref()
                .unwrap()
                .select_pixels_with_rng(&processed, &mut rng);
            assert_eq!(pixels.len(), 8);
            let coords: BTreeSet<_> = pixels.iter().map(|p| (p.x, p.y)).collect();
            assert_eq!(coords.len(), 8);
            for p in &pixels {
                assert_eq!(processed.get_meta_data(p.x, p.y, "class"), MetadataValue::Integer(2));
                let mean = p.spectrum.mean().unwrap();
                assert!(mean.abs() < 1e-9);
            }

            let regions = config
                .extractor
                .as_ref()
                .unwrap()
                .extract_regions(&processed)
                .unwrap();
            assert_eq!(regions.len(), 4);
            assert!(regions.iter().all(|r| r.shape() == [2, 3, 6]));
            assert_eq!(regions[3].full_id(), format!("{id}:0_3"));
        }
    }
}

#[test]
fn splits_feed_the_model() {
    let reader = reader(10);
    let config = config();
    let mut splitter = HappySplitter::from_reader("memory", &reader).unwrap();
    splitter.generate_splits(config.splits.as_ref().unwrap()).unwrap();

    assert_eq!(splitter.holdout_ids().len(), 2);
    let fold = splitter.get_train_validation_test_splits(0, 0).unwrap();
    assert_eq!(fold.len(), 8);
    assert_eq!(fold.test.len(), 2);

    let mut model = MeanBaseline::new(&reader);
    let result = run_fold(&mut model, &splitter, 0, 0, "firmness").unwrap();
    let actuals = result.prediction.actuals.unwrap();
    assert_eq!(actuals.len(), 2);
    assert!(actuals.iter().all(|a| a.as_f64().is_some()));
    assert!(matches!(
        splitter.get_train_validation_test_splits(0, 1),
        Err(HappyError::OutOfRange { .. })
    ));
}

#[test]
fn batch_skips_bad_references() {
    let reader = reader(3);
    let ids = reader.get_sample_ids().unwrap();
    let report = run_batch(&ids, |id| {
        let raw = reader.load_data(id)?.remove(0);
        let white = if id == "s1" {
            let narrow = Array3::from_elem((1, 3, raw.num_bands()), 2000.0);
            HappyData::from_cube(id, "white", narrow, None)?
        } else {
            white_for(&raw)
        };
        Ok(normalize_reflectance(&raw, Some(&white), None, WhiteReference::ColumnMean)?)
    })
    .unwrap();

    assert_eq!(report.outputs.len(), 2);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].id, "s1");
    assert!(report.failures[0].message.contains("shape mismatch"));
}

#[test]
fn config_and_splits_persist() {
    let dir = tempfile::tempdir().unwrap();
    let config = config();
    let config_path = dir.path().join("pipeline.json");
    config.save_json(&config_path).unwrap();
    assert_eq!(PipelineConfig::load_json(&config_path).unwrap(), config);

    let reader = reader(5);
    let mut splitter = HappySplitter::from_reader("memory", &reader).unwrap();
    splitter
        .generate_splits(&SplitSettings {
            num_repeats: 2,
            num_folds: 3,
            seed: Some(1),
            ..SplitSettings::new(60.0, 20.0)
        })
        .unwrap();
    let splits_path = dir.path().join("splits.json");
    splitter.save_splits_to_json(&splits_path).unwrap();
    let loaded = HappySplitter::load_splits_from_json(&splits_path).unwrap();
    assert_eq!(loaded.num_repeats(), 2);
    assert_eq!(loaded.num_folds(1).unwrap(), 3);
    assert_eq!(loaded.base_folder(), "memory");
    assert_eq!(
        loaded.get_train_validation_test_splits(1, 2).unwrap(),
        splitter.get_train_validation_test_splits(1, 2).unwrap()
    );
}
