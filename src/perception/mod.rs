pub mod annotator;
pub mod confidence;
pub mod dedup;
pub mod normalize;
pub mod raw_element;
pub mod scaling;
pub mod types;
