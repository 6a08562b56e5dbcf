/// Hyperspectral cube pipeline.
///
/// ```text
///   splitter ── ids ──► reader ──► HappyData ──► preprocess chain
///                                                    │
///                                   ┌────────────────┴───────────────┐
///                                   ▼                                ▼
///                            pixel selector                   region extractor
///                                   │                                │
///                                   └──────────────► model ◄─────────┘
/// ```

pub mod batch;
pub mod config;
pub mod data;
pub mod error;
pub mod estimator;
pub mod preprocess;
pub mod region;
pub mod select;
pub mod split;

pub use config::PipelineConfig;
pub use data::criteria::{Criteria, CriteriaGroup, CriteriaOp};
pub use data::model::{BoundingBox, HappyData, MetadataLayer, MetadataValue};
pub use error::{HappyError, Result};
pub use preprocess::{MultiPreprocessor, Preprocessor, PreprocessorConfig};
pub use region::RegionExtractor;
pub use select::{PixelSelector, SelectedPixel};
pub use split::{HappySplitter, SplitSettings};
