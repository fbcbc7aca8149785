pub mod app;
pub mod bib;
pub mod config;
pub mod domain;
pub mod error;
pub mod fs_util;
pub mod normalize;
pub mod output;
pub mod patch;
pub mod sheet;
pub mod store;
pub mod validate;
