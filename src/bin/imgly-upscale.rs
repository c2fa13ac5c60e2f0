//! imgly-upscale command-line tool
//!
//! Enhances and upscales images through the tiered super-resolution engine.

#[cfg(feature = "cli")]
use imgly_upscale::cli;

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cli::main().await
}

#[cfg(not(feature = "cli"))]
fn main() {
    eprintln!("CLI feature not enabled. Please rebuild with --features cli");
    std::process::exit(1);
}
