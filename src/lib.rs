pub mod algorithms;
pub mod benchmark;
pub mod canvas;
pub mod catalog_loader;
pub mod effect_chain;
pub mod effects;
pub mod enhancer;
pub mod errors;
pub mod gpu;
pub mod host;
pub mod overlay;
pub mod pipeline_builder;
pub mod registry;
pub mod renderer;
pub mod schema;
pub mod settings;
pub mod video;
