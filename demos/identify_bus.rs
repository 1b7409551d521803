// demos/identify_bus.rs

use smart_passthru::{discover, DeviceKind};
use std::path::PathBuf;

fn main() {
    println!("--- Disk protocol identifier ---");
    println!("NOTE: querying some devices requires administrator privileges.\n");

    let paths: Vec<PathBuf> = match std::env::args_os().skip(1).map(PathBuf::from).collect::<Vec<_>>() {
        given if !given.is_empty() => given,
        _ => match discover() {
            Ok(devices) => devices.into_iter().map(|d| d.path).collect(),
            Err(e) => {
                eprintln!("Error listing devices: {e}");
                return;
            }
        },
    };

    for path in paths {
        print!("Device: {} -> ", path.display());
        match DeviceKind::detect(&path) {
            Ok(DeviceKind::ScsiAta) => println!("Protocol: SCSI/ATA"),
            Ok(DeviceKind::Nvme) => println!("Protocol: NVMe"),
            Err(e) => println!("Error querying protocol: {e}"),
        }
    }
}
