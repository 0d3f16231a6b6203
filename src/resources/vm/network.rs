//! Network slot codec.

use super::{merge_slots, NetworkSlot};
use crate::client::models::{NetRecord, NET_MODEL_VIRTIO};

/// Encode a slot. The model is always virtio; the backend assigns the MAC.
pub fn encode(slot: &NetworkSlot) -> NetRecord {
    NetRecord {
        model: Some(NET_MODEL_VIRTIO.to_string()),
        macaddr: None,
        bridge: Some(slot.bridge.clone()),
        firewall: Some(slot.firewall),
    }
}

/// Copy the fields the backend reports; absent ones are left alone.
pub fn decode_into(slot: &mut NetworkSlot, record: &NetRecord) {
    if let Some(bridge) = &record.bridge {
        slot.bridge = bridge.clone();
    }
    if let Some(firewall) = record.firewall {
        slot.firewall = firewall;
    }
}

/// Reconcile local network slots with the backend's positional array.
pub fn merge_networks(local: &mut Vec<Option<NetworkSlot>>, observed: &[Option<NetRecord>]) {
    merge_slots(local, observed, |_, _| true, decode_into);
}
