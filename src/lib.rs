#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
// #![warn(clippy::cargo)]

extern crate blas_src;

pub mod acquisition;
pub mod budget;
pub mod calculators;
pub mod config;
pub mod error;
pub mod fit;
pub mod instrument;
pub mod math;
pub(crate) mod minimisation;
pub mod output;
pub mod polarity;
pub mod procedure;
pub mod reduce;
pub mod resistor;
pub mod store;
pub mod uncertain;

pub use error::{Error, Result};
