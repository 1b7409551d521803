use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use smart_passthru::nvme::{cns, log_page, NvmeAdminCommand, IDENTIFY_LEN, NSID_ALL, SMART_LOG_LEN};
use smart_passthru::scsi::{smart_feature, AtaPassThrough16, InquiryCommand};
use smart_passthru::{
    discover, Cdb, Command, DataPhase, Device, DeviceKind, Identity, Options, RecoveredErrorPolicy, SmartError,
    SmartStatus, SmartTable, StorageDevice, TransportError,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing::warn;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "SMART_PASSTHRU_LOG";

#[derive(Parser, Debug)]
#[command(
    name = "smart-passthru",
    version,
    about = "Read identification and S.M.A.R.T. data through OS pass-through (needs root/administrator)"
)]
struct Args {
    /// Per-command timeout in milliseconds
    #[arg(long, value_name = "MS", default_value_t = 3000, global = true)]
    timeout_ms: u64,

    /// Treat RECOVERED ERROR completions as failures
    #[arg(long, action = clap::ArgAction::SetTrue, global = true)]
    strict_recovered: bool,

    /// Log at debug level (overrides SMART_PASSTHRU_LOG)
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// List the disks found on this host with model, serial and temperature
    Enumerate,
    /// Human-readable identity and health
    Details { path: PathBuf },
    /// Identity and health as JSON
    Json { path: PathBuf },
    /// Raw response of a single command
    Dump {
        path: PathBuf,
        what: DumpTarget,
        /// Write the raw bytes to stdout instead of a hex table
        #[arg(long, action = clap::ArgAction::SetTrue)]
        binary: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum DumpTarget {
    Inquiry,
    Identify,
    Smart,
    Thresholds,
    Health,
}

#[derive(Serialize)]
struct Report<'a> {
    path: &'a Path,
    kind: DeviceKind,
    identity: Identity,
    smart: Option<SmartTable>,
    smart_status: Option<SmartStatus>,
    temperature_celsius: Option<i32>,
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    let options = Options::default()
        .with_timeout(Duration::from_millis(args.timeout_ms))
        .with_recovered_errors(if args.strict_recovered {
            RecoveredErrorPolicy::Reject
        } else {
            RecoveredErrorPolicy::Accept
        });

    let result = match args.command {
        Cmd::Enumerate => enumerate(options),
        Cmd::Details { path } => details(&path, options),
        Cmd::Json { path } => json(&path, options),
        Cmd::Dump { path, what, binary } => dump(&path, options, what, binary),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report_error(&err);
            ExitCode::FAILURE
        }
    }
}

fn report_error(err: &SmartError) {
    eprintln!("error[{}]: {err}", err.kind());
    if let Some(code) = err.os_code() {
        eprintln!("  os error code: {code}");
    }
    if let SmartError::Command(failure) = err {
        eprintln!("  diagnostic: {} ({:?})", failure.diagnostic, failure.diagnostic.severity);
        let sense = failure.status.sense();
        if !sense.is_empty() {
            eprintln!("  sense: {}", hex::encode(sense));
        }
    }
}

fn kind_label(kind: DeviceKind) -> &'static str {
    match kind {
        DeviceKind::ScsiAta => "scsi/ata",
        DeviceKind::Nvme => "nvme",
    }
}

fn row_fields<D: StorageDevice>(device: &mut D) -> Result<(String, String, Option<i32>), SmartError> {
    let model = device.model()?;
    let serial = device.serial()?;
    let temperature = match device.temperature() {
        Ok(celsius) => celsius,
        Err(SmartError::Command(failure)) => {
            warn!(path = %device.path().display(), diagnostic = %failure.diagnostic, "no temperature");
            None
        }
        Err(err) => return Err(err),
    };
    Ok((model, serial, temperature))
}

/// One `enumerate` line: model, serial and temperature of an opened device,
/// or the error kind that stopped it. The device is closed afterwards.
fn enumerate_row<D: StorageDevice>(path: &Path, kind: DeviceKind, opened: Result<D, SmartError>) -> String {
    let fields = opened.and_then(|mut device| {
        let fields = row_fields(&mut device);
        device.close();
        fields
    });
    let kind = kind_label(kind);
    match fields {
        Ok((model, serial, temperature)) => {
            let temperature = temperature.map_or_else(|| "-".to_string(), |c| format!("{c} C"));
            format!("{:<28} {kind:<9} {model:<40} {serial:<20} {temperature}", path.display())
        }
        Err(err) => format!("{:<28} {kind:<9} error[{}]", path.display(), err.kind()),
    }
}

fn enumerate(options: Options) -> Result<(), SmartError> {
    let devices = discover()?;
    if devices.is_empty() {
        println!("no devices found");
        return Ok(());
    }
    println!("{:<28} {:<9} {:<40} {:<20} TEMPERATURE", "PATH", "KIND", "MODEL", "SERIAL");
    for found in devices {
        let opened: Result<Device, SmartError> = Device::open_with_options(&found.path, options.clone());
        println!("{}", enumerate_row(&found.path, found.kind, opened));
    }
    Ok(())
}

fn collect<'a>(path: &'a Path, options: Options) -> Result<Report<'a>, SmartError> {
    let mut device: Device = Device::open_with_options(path, options)?;
    let identity = device.identify()?;
    let smart = match device.smart_table() {
        Ok(table) => Some(table),
        Err(SmartError::Command(failure)) => {
            warn!(diagnostic = %failure.diagnostic, "no SMART data");
            None
        }
        Err(err) => return Err(err),
    };
    let smart_status = match &mut device {
        Device::ScsiAta(ata) if identity.smart_supported == Some(true) => match ata.smart_status() {
            Ok(status) => Some(status),
            Err(err) => {
                warn!(%err, "SMART RETURN STATUS unavailable");
                None
            }
        },
        _ => None,
    };
    let temperature_celsius = smart.as_ref().and_then(SmartTable::temperature);
    let kind = device.kind();
    device.close();
    Ok(Report {
        path,
        kind,
        identity,
        smart,
        smart_status,
        temperature_celsius,
    })
}

fn details(path: &Path, options: Options) -> Result<(), SmartError> {
    let report = collect(path, options)?;
    let id = &report.identity;
    println!("Device:        {}", report.path.display());
    println!("Model:         {}", id.model);
    println!("Serial:        {}", id.serial);
    println!("Firmware:      {}", id.firmware);
    if let Some(vendor) = &id.vendor {
        println!("Vendor:        {vendor}");
    }
    if let Some(bytes) = id.capacity_bytes {
        println!("Capacity:      {bytes} bytes ({:.1} GB)", bytes as f64 / 1e9);
    }
    if let Some(status) = report.smart_status {
        println!("SMART status:  {status:?}");
    }
    if let Some(celsius) = report.temperature_celsius {
        println!("Temperature:   {celsius} C");
    }
    match &report.smart {
        Some(SmartTable::Ata { attributes }) => {
            println!();
            println!("ID  {:<34} FLAG   VAL WORST THRESH RAW", "ATTRIBUTE");
            for a in attributes {
                let threshold = a.threshold.map_or_else(|| "-".to_string(), |t| t.to_string());
                let mark = if a.exceeded { "  FAILING" } else { "" };
                println!(
                    "{:>3} {:<34} 0x{:04x} {:>3} {:>5} {:>6} {}{mark}",
                    a.id, a.name, a.flags, a.current, a.worst, threshold, a.raw_value
                );
            }
        }
        Some(SmartTable::Nvme(health)) => {
            println!();
            println!("Critical warning: 0x{:02x} {:?}", health.critical_warning, health.warnings());
            for (name, value) in &health.metrics {
                println!("  {name:<34} {value}");
            }
        }
        None => println!("SMART data:    unavailable"),
    }
    Ok(())
}

fn json(path: &Path, options: Options) -> Result<(), SmartError> {
    let report = collect(path, options)?;
    let out = serde_json::to_string_pretty(&report).map_err(std::io::Error::from)?;
    println!("{out}");
    Ok(())
}

fn dump_command(kind: DeviceKind, what: DumpTarget) -> Option<(Command, usize)> {
    let ata = |cdb: AtaPassThrough16| Some((Command::Scsi(Cdb::from(&cdb)), 512));
    match (kind, what) {
        (DeviceKind::ScsiAta, DumpTarget::Inquiry) => Some((Command::Scsi(Cdb::from(&InquiryCommand::new(96))), 96)),
        (DeviceKind::ScsiAta, DumpTarget::Identify) => ata(AtaPassThrough16::identify_device()),
        (DeviceKind::ScsiAta, DumpTarget::Smart) => ata(AtaPassThrough16::smart_read(smart_feature::READ_DATA)),
        (DeviceKind::ScsiAta, DumpTarget::Thresholds) => {
            ata(AtaPassThrough16::smart_read(smart_feature::READ_THRESHOLDS))
        }
        (DeviceKind::Nvme, DumpTarget::Identify) => Some((
            Command::NvmeAdmin(NvmeAdminCommand::identify(cns::CONTROLLER, 0)),
            IDENTIFY_LEN,
        )),
        (DeviceKind::Nvme, DumpTarget::Smart | DumpTarget::Health) => Some((
            Command::NvmeAdmin(NvmeAdminCommand::get_log_page(
                log_page::SMART_HEALTH,
                NSID_ALL,
                SMART_LOG_LEN as u32,
            )),
            SMART_LOG_LEN,
        )),
        _ => None,
    }
}

fn dump(path: &Path, options: Options, what: DumpTarget, binary: bool) -> Result<(), SmartError> {
    let mut device: Device = Device::open_with_options(path, options)?;
    let Some((command, len)) = dump_command(device.kind(), what) else {
        return Err(TransportError::Unsupported("this dump is not available for the device's protocol").into());
    };
    let mut buf = vec![0u8; len];
    let completion = device.issue_raw_command(&command, DataPhase::In(&mut buf))?;
    let data = &buf[..completion.bytes_transferred.min(len)];
    if binary {
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(data)?;
        stdout.flush()?;
    } else {
        for (row, chunk) in data.chunks(16).enumerate() {
            let ascii: String = chunk
                .iter()
                .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
                .collect();
            let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
            println!("{:04x}  {:<47}  {ascii}", row * 16, hex.join(" "));
        }
        let sense = completion.status.sense();
        if !sense.is_empty() {
            println!("sense: {}", hex::encode(sense));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use smart_passthru::{Completion, OpenError};

    struct Canned {
        path: PathBuf,
        identity: Result<Identity, TransportError>,
        temperature: Option<i32>,
        open: bool,
    }

    impl Canned {
        fn new(model: &str, temperature: Option<i32>) -> Self {
            Self {
                path: PathBuf::from("/dev/sda"),
                identity: Ok(Identity {
                    model: model.to_string(),
                    serial: "S3Z9NB0K123456".to_string(),
                    firmware: "RVT02B6Q".to_string(),
                    vendor: None,
                    device_type: None,
                    capacity_bytes: None,
                    smart_supported: Some(true),
                }),
                temperature,
                open: true,
            }
        }
    }

    impl StorageDevice for &mut Canned {
        fn path(&self) -> &Path {
            &self.path
        }

        fn kind(&self) -> DeviceKind {
            DeviceKind::ScsiAta
        }

        fn is_open(&self) -> bool {
            self.open
        }

        fn close(&mut self) {
            self.open = false;
        }

        fn issue_raw_command(&mut self, _: &Command, _: DataPhase<'_>) -> Result<Completion, SmartError> {
            Err(TransportError::Unsupported("canned device").into())
        }

        fn identify(&mut self) -> Result<Identity, SmartError> {
            self.identity.clone().map_err(SmartError::from)
        }

        fn smart_table(&mut self) -> Result<SmartTable, SmartError> {
            Err(TransportError::Unsupported("canned device").into())
        }

        fn temperature(&mut self) -> Result<Option<i32>, SmartError> {
            Ok(self.temperature)
        }
    }

    #[test]
    fn row_shows_identity_and_temperature() {
        let mut device = Canned::new("Samsung SSD 860 EVO 1TB", Some(31));
        let row = enumerate_row(Path::new("/dev/sda"), DeviceKind::ScsiAta, Ok(&mut device));
        assert!(row.starts_with("/dev/sda"), "{row}");
        assert!(row.contains("scsi/ata"), "{row}");
        assert!(row.contains("Samsung SSD 860 EVO 1TB"), "{row}");
        assert!(row.contains("S3Z9NB0K123456"), "{row}");
        assert!(row.ends_with("31 C"), "{row}");
        assert!(!device.open);
    }

    #[test]
    fn row_without_temperature_shows_dash() {
        let mut device = Canned::new("WDC WD40EFRX-68N32N0", None);
        let row = enumerate_row(Path::new("/dev/sdb"), DeviceKind::ScsiAta, Ok(&mut device));
        assert!(row.ends_with(" -"), "{row}");
    }

    #[test]
    fn failing_identify_reports_kind_and_closes() {
        let mut device = Canned::new("unused", None);
        device.identity = Err(TransportError::Timeout);
        let row = enumerate_row(Path::new("/dev/sdc"), DeviceKind::ScsiAta, Ok(&mut device));
        assert!(row.ends_with("error[transport]"), "{row}");
        assert!(!device.open);
    }

    #[test]
    fn open_failure_reports_kind() {
        let path = Path::new("/dev/nvme1");
        let opened: Result<&mut Canned, SmartError> = Err(OpenError::PermissionDenied(path.to_path_buf()).into());
        let row = enumerate_row(path, DeviceKind::Nvme, opened);
        assert!(row.starts_with("/dev/nvme1"), "{row}");
        assert!(row.contains("nvme"), "{row}");
        assert!(row.ends_with("error[permission-denied]"), "{row}");
    }
}
