// See <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

pub mod cas;
pub mod loading;
pub mod typed;
pub mod utils;

pub use utils::*;
