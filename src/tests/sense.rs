use super::*;
use crate::scsi::status;

fn fixed(key: u8, asc: u8, ascq: u8) -> SenseData {
    let mut raw = [0u8; 18];
    raw[0] = 0x70;
    raw[2] = key;
    raw[7] = 10;
    raw[12] = asc;
    raw[13] = ascq;
    SenseData::new(&raw)
}

fn descriptor(key: u8, asc: u8, ascq: u8, descriptors: &[u8]) -> SenseData {
    let mut raw = vec![0x72, key, asc, ascq, 0, 0, 0, descriptors.len() as u8];
    raw.extend_from_slice(descriptors);
    SenseData::new(&raw)
}

#[test]
fn all_zero_sense_is_success() {
    let sense = SenseData::new(&[0u8; 32]);
    assert!(sense.is_empty());
    assert_eq!(sense.parse(), None);
    assert_eq!(classify_scsi(&sense, status::GOOD).category, Category::Success);
    assert_eq!(classify_scsi(&SenseData::empty(), status::GOOD), Diagnostic::success());
}

#[test]
fn check_condition_without_sense_is_unknown() {
    let d = classify_scsi(&SenseData::empty(), status::CHECK_CONDITION);
    assert_eq!(d.category, Category::Unknown);
    assert!(d.is_failure());
}

#[test]
fn sense_key_table() {
    let table = [
        ((0x0, 0x00, 0x00), Category::Success),
        ((0x1, 0x00, 0x1D), Category::RecoveredError),
        ((0x2, 0x04, 0x01), Category::NotReady),
        ((0x2, 0x3A, 0x00), Category::NotReady),
        ((0x3, 0x11, 0x00), Category::MediumError),
        ((0x4, 0x00, 0x00), Category::HardwareError),
        ((0x5, 0x20, 0x00), Category::IllegalRequest),
        ((0x5, 0x24, 0x00), Category::IllegalRequest),
        ((0x6, 0x29, 0x00), Category::UnitAttention),
        ((0x7, 0x27, 0x00), Category::Unknown),
        ((0x9, 0x80, 0x00), Category::VendorSpecific),
        ((0xB, 0x47, 0x00), Category::AbortedCommand),
        ((0xE, 0x1D, 0x00), Category::Unknown),
    ];
    for ((key, asc, ascq), expected) in table {
        assert_eq!(
            classify_scsi(&fixed(key, asc, ascq), status::CHECK_CONDITION).category,
            expected,
            "key {key:X} asc {asc:02X} ascq {ascq:02X}"
        );
        assert_eq!(
            classify_scsi(&descriptor(key, asc, ascq, &[]), status::CHECK_CONDITION).category,
            expected
        );
    }
}

#[test]
fn asc_refines_message_only() {
    let a = classify_scsi(&fixed(0x5, 0x20, 0x00), status::CHECK_CONDITION);
    let b = classify_scsi(&fixed(0x5, 0x24, 0x00), status::CHECK_CONDITION);
    assert_eq!(a.category, b.category);
    assert_ne!(a.cause, b.cause);
    assert!(b.cause.contains("invalid field in CDB"));

    let unknown = classify_scsi(&fixed(0x3, 0x31, 0x01), status::CHECK_CONDITION);
    assert!(unknown.cause.contains("31h/01h"));
}

#[test]
fn deferred_errors_are_marked() {
    let mut raw = [0u8; 18];
    raw[0] = 0x71;
    raw[2] = 0x3;
    let d = classify_scsi(&SenseData::new(&raw), status::CHECK_CONDITION);
    assert_eq!(d.category, Category::MediumError);
    assert!(d.cause.starts_with("deferred error"));
}

#[test]
fn unrecognised_response_code() {
    let d = classify_scsi(&SenseData::new(&[0x7F, 0, 5]), status::CHECK_CONDITION);
    assert_eq!(d.category, Category::Unknown);
}

#[test]
fn ata_status_return_descriptor() {
    let ata = [
        0x09, 0x0C, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x4F, 0x00, 0xC2, 0x00, 0x50,
    ];
    let sense = descriptor(0x1, 0x00, 0x1D, &ata);
    let regs = sense.ata_status_return().unwrap();
    assert_eq!(regs.lba_mid, 0x4F);
    assert_eq!(regs.lba_high, 0xC2);
    assert_eq!(regs.status, 0x50);
    assert_eq!(sense.descriptors().count(), 1);
}

#[test]
fn descriptor_walk_skips_other_types() {
    let mut body = vec![0x00, 0x0A, 0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0];
    body.extend_from_slice(&[
        0x09, 0x0C, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xF4, 0x00, 0x2C, 0x00, 0x50,
    ]);
    let sense = descriptor(0x1, 0x00, 0x1D, &body);
    let codes: Vec<u8> = sense.descriptors().map(|d| d.code).collect();
    assert_eq!(codes, vec![0x00, 0x09]);
    let regs = sense.ata_status_return().unwrap();
    assert_eq!((regs.lba_mid, regs.lba_high), (0xF4, 0x2C));
}

#[test]
fn fixed_format_ata_registers() {
    let mut raw = [0u8; 18];
    raw[0] = 0x70;
    raw[2] = 0x1;
    raw[4] = 0x50;
    raw[10] = 0x4F;
    raw[11] = 0xC2;
    raw[12] = 0x00;
    raw[13] = 0x1D;
    let regs = SenseData::new(&raw).ata_status_return().unwrap();
    assert_eq!(regs.status, 0x50);
    assert_eq!((regs.lba_mid, regs.lba_high), (0x4F, 0xC2));
}

#[test]
fn sense_is_truncated_to_buffer() {
    let sense = SenseData::new(&[0x70; 40]);
    assert_eq!(sense.as_bytes().len(), SENSE_BUFFER_LEN);
}

#[test]
fn nvme_status_fields() {
    let status = NvmeStatusField(0x4109);
    assert_eq!(status.sct(), 1);
    assert_eq!(status.sc(), 0x09);
    assert!(status.do_not_retry());
    assert!(!status.more());
    let d = status.diagnostic();
    assert_eq!(d.category, Category::IllegalRequest);
    assert!(d.cause.starts_with("Invalid Log Page"));

    let dw3 = (0x0002u32 << 17) | 1 << 16;
    assert_eq!(NvmeStatusField::from_completion_dw3(dw3), NvmeStatusField(0x0002));
}

#[test]
fn nvme_status_table() {
    let table = [
        (0x0000, Category::Success),
        (0x0001, Category::IllegalRequest),
        (0x0002, Category::IllegalRequest),
        (0x0004, Category::MediumError),
        (0x0006, Category::HardwareError),
        (0x0007, Category::AbortedCommand),
        (0x0080, Category::IllegalRequest),
        (0x0082, Category::NotReady),
        (0x0281, Category::MediumError),
        (0x0300, Category::HardwareError),
        (0x07C0, Category::VendorSpecific),
        (0x0600, Category::Unknown),
    ];
    for (field, expected) in table {
        assert_eq!(NvmeStatusField(field).category(), expected, "{field:04X}");
    }
    assert!(NvmeStatusField(0).is_success());
    assert!(NvmeStatusField(0x0600).diagnostic().cause.contains("type 6h"));
}
