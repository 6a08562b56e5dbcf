/// Data layer: the cube container, pixel criteria, normalization, and I/O seams.
///
/// Architecture:
/// ```text
///   reader (HappyReader) ── raw scan + white/dark refs
///        │
///        ▼
///   ┌────────────┐
///   │ normalize   │  (scan - dark) / (white - dark)
///   └────────────┘
///        │
///        ▼
///   ┌────────────┐
///   │ HappyData   │  cube (h, w, bands), global dict, per-pixel layers
///   └────────────┘
///        │
///        ▼
///   ┌────────────┐
///   │ criteria    │  per-pixel predicates → selection / region masks
///   └────────────┘
///        │
///        ▼
///   writer (HappyWriter)
/// ```

pub mod criteria;
pub mod loader;
pub mod model;
pub mod normalize;
