//! Services at the edge of the engine

mod io;

pub use io::{ImageIoService, OutputFormat};
