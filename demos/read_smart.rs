// demos/read_smart.rs

use smart_passthru::{discover, Device, DiscoveredDevice, SmartError, SmartTable, StorageDevice};

fn main() {
    println!("--- smart-passthru: data collection check ---");
    println!("Discovering devices and reading SMART data...");
    println!("NOTE: opening devices requires administrator or root privileges!\n");

    let devices = match discover() {
        Ok(devices) => devices,
        Err(e) => {
            eprintln!("[ERROR] Failed to discover devices: {e}");
            return;
        }
    };
    if devices.is_empty() {
        println!("No storage devices were found.");
        return;
    }

    println!("Found {} device(s):", devices.len());
    for found in &devices {
        if let Err(e) = print_device_info(found) {
            eprintln!("\n[ERROR] {}: {e} [{}]", found.path.display(), e.kind());
            if matches!(e, SmartError::Open(_)) {
                eprintln!("  Common causes:");
                eprintln!("  - Windows: 'Access is denied. (os error 5)'");
                eprintln!("  - Linux/macOS: 'Permission denied (os error 13)'");
            }
        }
    }
}

fn print_device_info(found: &DiscoveredDevice) -> Result<(), SmartError> {
    let mut device: Device = Device::open(&found.path)?;
    let identity = device.identify()?;

    println!("\n----------------------------------------");
    println!("  Device Path:  {}", found.path.display());
    println!("  Protocol:     {:?}", device.kind());
    println!("  Model:        {}", identity.model);
    println!("  Serial:       {}", identity.serial);
    println!("  Firmware:     {}", identity.firmware);
    println!("----------------------------------------");

    let table = device.smart_table()?;
    let temperature = table.temperature().map_or("N/A".to_string(), |t| t.to_string());
    println!("  {:<24}: {}", "Temperature (Celsius)", temperature);
    println!("  {:<24}: {}", "Threshold exceeded", table.exceeded());

    match &table {
        SmartTable::Ata { attributes } => {
            for attribute in attributes {
                println!("    - {:<30}: {}", attribute.name, attribute.raw_value);
            }
        }
        SmartTable::Nvme(health) => {
            for (name, value) in &health.metrics {
                println!("    - {name:<30}: {value}");
            }
        }
    }
    println!("----------------------------------------");
    device.close();
    Ok(())
}
