//! Devices command implementation
//!
//! Connects to every registered device and prints the properties it reports.

use pricer_compute::{ComputeConfig, ComputeFramework};
use tracing::{info, warn};

use crate::Result;

/// Run the devices command
pub fn run(config: &ComputeConfig, device: Option<&str>) -> Result<()> {
    let mut framework = ComputeFramework::new(config);
    let names = match device {
        Some(name) => vec![name.to_string()],
        None => framework.available_devices(),
    };
    info!(devices = names.len(), "Querying devices");

    for name in &names {
        let context = match framework.context(name) {
            Ok(context) => context,
            Err(err) if device.is_none() => {
                warn!(device = %name, error = %err, "Device unavailable");
                println!("{} (unavailable: {})", name, err);
                continue;
            }
            Err(err) => return Err(err.into()),
        };

        println!("{}", name);
        let width = context
            .device_info()
            .iter()
            .map(|(key, _)| key.len())
            .max()
            .unwrap_or(0);
        for (key, value) in context.device_info() {
            println!("  {:<width$}  {}", key, value, width = width);
        }
        println!(
            "  {:<width$}  {}",
            "double_precision",
            context.supports_double_precision(),
            width = width
        );
    }

    Ok(())
}
