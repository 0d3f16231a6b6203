//! Disk slot codec.
//!
//! Encoding turns a declaration into the `file` directive the backend
//! understands: an existing volume, `{storage}:{size}` for a fresh
//! allocation, or `{storage}:0` plus `import-from` for a copy. Decoding
//! recovers the volume id and storage pool from what the backend reports.

use std::path::Path;

use super::{merge_slots, DiskSlot};
use crate::client::models::{DiskRecord, MEDIA_CDROM};

/// Encode a slot. Content wins over size, size over import; a slot with
/// none of those falls back to its recorded volume id.
///
/// Returns `None` when the slot names no volume at all.
pub fn encode(slot: &DiskSlot) -> Option<DiskRecord> {
    let storage = slot.storage.as_deref().unwrap_or_default();

    let mut record = if let Some(content) = non_empty(&slot.content) {
        let mut record = DiskRecord::new(content);
        if is_iso(content) {
            record.media = Some(MEDIA_CDROM.to_string());
        }
        record
    } else if let Some(size) = slot.size_gb.filter(|size| *size != 0) {
        DiskRecord::new(format!("{}:{}", storage, size))
    } else if let Some(source) = non_empty(&slot.import_from) {
        // An import is always a disk, never a CD-ROM.
        DiskRecord {
            import_from: Some(source.to_string()),
            media: None,
            ..DiskRecord::new(format!("{}:0", storage))
        }
    } else {
        DiskRecord::new(non_empty(&slot.volume_id)?)
    };

    record.snapshot = slot.readonly;
    record.backup = slot.backup;
    Some(record)
}

/// Fold an observed record into `slot`, touching only what the backend
/// reports.
pub fn decode_into(slot: &mut DiskSlot, record: &DiskRecord) {
    if !record.file.starts_with("/dev") {
        if let Some((storage, _)) = record.file.split_once(':') {
            slot.storage = Some(storage.to_string());
        }
    }
    slot.volume_id = Some(record.file.clone());
    slot.readonly = merge_flag(slot.readonly, record.snapshot);
    slot.backup = merge_flag(slot.backup, record.backup);
}

/// A flag becomes `true` when the backend reports `true`. A flag the user
/// set keeps tracking the backend. An unset flag stays unset when the
/// backend omits it or reports `false`.
pub fn merge_flag(prior: Option<bool>, observed: Option<bool>) -> Option<bool> {
    if observed == Some(true) || prior.is_some() {
        Some(observed.unwrap_or(false))
    } else {
        prior
    }
}

/// Reconcile local disk slots with the backend's positional array.
///
/// A slot is merged in place only while its volume id still matches the
/// observed `file`; a different volume at that index means a different
/// disk and the slot is rebuilt.
pub fn merge_disks(local: &mut Vec<Option<DiskSlot>>, observed: &[Option<DiskRecord>]) {
    merge_slots(
        local,
        observed,
        |slot, record| slot.volume_id.as_deref() == Some(record.file.as_str()),
        decode_into,
    );
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

fn is_iso(content: &str) -> bool {
    Path::new(content).extension().is_some_and(|ext| ext == "iso")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot() -> DiskSlot {
        DiskSlot::default()
    }

    #[test]
    fn test_encode_content_iso_is_cdrom() {
        let record = encode(&DiskSlot {
            content: Some("local:iso/debian-12.iso".to_string()),
            ..slot()
        })
        .unwrap();
        assert_eq!(record.file, "local:iso/debian-12.iso");
        assert_eq!(record.media.as_deref(), Some(MEDIA_CDROM));

        let record = encode(&DiskSlot {
            content: Some("local-lvm:vm-100-disk-3".to_string()),
            ..slot()
        })
        .unwrap();
        assert_eq!(record.media, None);
    }

    #[test]
    fn test_encode_size_allocates() {
        let record = encode(&DiskSlot {
            storage: Some("local-lvm".to_string()),
            size_gb: Some(10),
            ..slot()
        })
        .unwrap();
        assert_eq!(record.file, "local-lvm:10");
        assert_eq!(record.import_from, None);
    }

    #[test]
    fn test_encode_import_clears_media() {
        let record = encode(&DiskSlot {
            storage: Some("local-lvm".to_string()),
            import_from: Some("nfs:100/base.qcow2".to_string()),
            ..slot()
        })
        .unwrap();
        assert_eq!(record.file, "local-lvm:0");
        assert_eq!(record.import_from.as_deref(), Some("nfs:100/base.qcow2"));
        assert_eq!(record.media, None);
    }

    #[test]
    fn test_encode_precedence_content_size_import() {
        let all = DiskSlot {
            storage: Some("local-lvm".to_string()),
            size_gb: Some(8),
            content: Some("local:iso/a.iso".to_string()),
            import_from: Some("nfs:base.raw".to_string()),
            ..slot()
        };
        assert_eq!(encode(&all).unwrap().file, "local:iso/a.iso");

        let size_and_import = DiskSlot { content: None, ..all.clone() };
        let record = encode(&size_and_import).unwrap();
        assert_eq!(record.file, "local-lvm:8");
        assert_eq!(record.import_from, None);

        let zero_size = DiskSlot { size_gb: Some(0), ..size_and_import };
        assert_eq!(encode(&zero_size).unwrap().file, "local-lvm:0");
        assert_eq!(encode(&zero_size).unwrap().import_from.as_deref(), Some("nfs:base.raw"));
    }

    #[test]
    fn test_encode_flags_in_every_mode() {
        let record = encode(&DiskSlot {
            content: Some("local:iso/a.iso".to_string()),
            readonly: Some(true),
            backup: Some(false),
            ..slot()
        })
        .unwrap();
        assert_eq!(record.snapshot, Some(true));
        assert_eq!(record.backup, Some(false));
    }

    #[test]
    fn test_encode_falls_back_to_volume_id() {
        let record = encode(&DiskSlot {
            volume_id: Some("local-lvm:vm-100-disk-0".to_string()),
            storage: Some("local-lvm".to_string()),
            ..slot()
        })
        .unwrap();
        assert_eq!(record.file, "local-lvm:vm-100-disk-0");
        assert_eq!(encode(&slot()), None);
    }

    #[test]
    fn test_content_reference_roundtrip() {
        for reference in ["local:iso/debian.iso", "ceph-pool:vm-101-disk-2", "nfs:100/base.qcow2"] {
            let declared = DiskSlot {
                content: Some(reference.to_string()),
                ..slot()
            };
            let record = encode(&declared).unwrap();

            let mut decoded = DiskSlot::default();
            decode_into(&mut decoded, &record);
            let (pool, _) = reference.split_once(':').unwrap();
            assert_eq!(decoded.volume_id.as_deref(), Some(reference));
            assert_eq!(decoded.storage.as_deref(), Some(pool));

            assert_eq!(encode(&decoded).unwrap().file, reference);
        }
    }

    #[test]
    fn test_decode_device_path_keeps_storage() {
        let mut decoded = DiskSlot {
            storage: Some("local".to_string()),
            ..slot()
        };
        decode_into(&mut decoded, &DiskRecord::new("/dev/disk/by-id/ata-foo"));
        assert_eq!(decoded.storage.as_deref(), Some("local"));
        assert_eq!(decoded.volume_id.as_deref(), Some("/dev/disk/by-id/ata-foo"));
    }

    #[test]
    fn test_merge_flag() {
        assert_eq!(merge_flag(None, None), None);
        assert_eq!(merge_flag(None, Some(false)), None);
        assert_eq!(merge_flag(None, Some(true)), Some(true));
        assert_eq!(merge_flag(Some(false), None), Some(false));
        assert_eq!(merge_flag(Some(true), None), Some(false));
        assert_eq!(merge_flag(Some(true), Some(true)), Some(true));
    }

    #[test]
    fn test_merge_disks_gap_propagates() {
        let mut local = vec![
            Some(DiskSlot {
                volume_id: Some("local-lvm:vm-100-disk-0".to_string()),
                size_gb: Some(10),
                storage: Some("local-lvm".to_string()),
                ..slot()
            }),
            None,
            None,
            Some(DiskSlot {
                volume_id: Some("local-lvm:vm-100-disk-9".to_string()),
                ..slot()
            }),
        ];
        let observed = vec![
            Some(DiskRecord::new("local-lvm:vm-100-disk-0")),
            Some(DiskRecord::new("local-lvm:vm-100-disk-1")),
            None,
            Some(DiskRecord::new("local-lvm:vm-100-disk-2")),
        ];
        merge_disks(&mut local, &observed);

        assert_eq!(local.len(), 4);
        // Same volume: user fields survive.
        assert_eq!(local[0].as_ref().unwrap().size_gb, Some(10));
        // New disk appeared in a former gap.
        assert_eq!(
            local[1].as_ref().unwrap().volume_id.as_deref(),
            Some("local-lvm:vm-100-disk-1")
        );
        assert!(local[2].is_none());
        // Different volume at index 3: rebuilt from the record.
        let rebuilt = local[3].as_ref().unwrap();
        assert_eq!(rebuilt.volume_id.as_deref(), Some("local-lvm:vm-100-disk-2"));
        assert_eq!(rebuilt.storage.as_deref(), Some("local-lvm"));
        assert_eq!(rebuilt.size_gb, None);
    }

    #[test]
    fn test_merge_disks_truncates_and_handles_absent_array() {
        let mut local = vec![Some(slot()), Some(slot())];
        merge_disks(&mut local, &[Some(DiskRecord::new("local:iso/a.iso"))]);
        assert_eq!(local.len(), 1);

        merge_disks(&mut local, &[]);
        assert!(local.is_empty());
    }
}
