use lazy_static::lazy_static;
use tera::Tera;

pub mod cli;
pub mod config;
pub mod error;
pub mod excel;
pub mod extract;
pub mod logging;
pub mod paths;
pub mod plan;
pub mod process;
pub mod runscript;
pub mod setup;
pub mod staging;
pub mod utils;

pub use error::{EseError, Result};

lazy_static! {
    pub static ref TEMPLATES: Tera =
        match Tera::new(concat!(env!("CARGO_MANIFEST_DIR"), "/templates/*")) {
            Ok(t) => t,
            Err(e) => panic!("Error parsing templates: {e}"),
        };
}
