//! sl1-to-photon - Convert an SL1 file to a Photon file

use sl1_to_photon::{config::Config, converter::Converter, error::Result};
use tracing::{error, info};

fn main() -> Result<()> {
    // Parse configuration and initialize logging
    let config = Config::from_args().unwrap_or_else(|e| {
        eprintln!("Configuration error: {}", e);
        std::process::exit(1);
    });

    let mut converter = Converter::new(config);

    match converter.run() {
        Ok(()) => {
            let stats = converter.get_conversion_stats();
            info!(
                "Converted {} layers on {} workers",
                stats.layer_count, stats.workers
            );
            println!("Output file written to: {}", stats.output_path.display());
            Ok(())
        }
        Err(e) => {
            error!("Conversion failed: {:#}", e);
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}
