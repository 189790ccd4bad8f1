//! The resource directory: cluster-wide `name -> master node` records.
//!
//! Each name has exactly one directory node per membership epoch, selected
//! by hash over the sorted member list. The directory node's record is
//! authoritative; the first node whose lookup reaches it becomes master.

use byteorder::{ByteOrder, LittleEndian};
use dashmap::DashMap;

use crate::rsb::RsbTable;

/// Stable 32-bit FNV-1a over a resource name. All nodes must agree on this
/// value, so no process-seeded hasher can be used here.
pub fn name_hash(name: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in name {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// The node that keeps the directory record for `name`.
///
/// The upper hash bits pick the node so they stay independent from the
/// lower bits used for bucket distribution. `members` must be sorted
/// ascending and non-empty.
pub fn dir_nodeid(name: &[u8], members: &[u32]) -> u32 {
    if members.len() == 1 {
        return members[0];
    }
    let slot = (name_hash(name) >> 16) as usize % members.len();
    members[slot]
}

/// This node's share of the directory.
pub struct Directory {
    entries: DashMap<Vec<u8>, u32>,
}

impl Directory {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Returns the master of `name`, installing `caller` as master first if
    /// no record exists. First lookup wins; concurrent lookups for a new
    /// name all see the single winner.
    pub fn lookup(&self, name: &[u8], caller: u32) -> u32 {
        *self.entries.entry(name.to_vec()).or_insert(caller)
    }

    /// Peek without creating.
    pub fn get(&self, name: &[u8]) -> Option<u32> {
        self.entries.get(name).map(|entry| *entry.value())
    }

    /// Removes the record, but only on request of the recorded master.
    pub fn remove(&self, name: &[u8], caller: u32) {
        let removed = self
            .entries
            .remove_if(name, |_, master| *master == caller);
        if removed.is_none() {
            tracing::debug!(caller, "directory remove without matching record");
        }
    }

    /// Installs a rebuilt record unconditionally.
    pub fn insert(&self, name: &[u8], master: u32) {
        self.entries.insert(name.to_vec(), master);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// How a names page ends.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PageEnd {
    /// More names follow; ask again with the last name received.
    Block,
    /// No names left on this peer.
    List,
}

const NAME_RECORD_FIXED: usize = 6; // nodeid u32 + length u16

/// Packs one page of `{master, name}` records for a rebuilding peer.
///
/// Only names this node masters and whose directory node (under the new
/// membership) is `requester` are sent. Pages resume after `last_name`; a
/// zero-length record with nodeid 0 ends a block, with nodeid 1 the list.
pub fn pack_names_page(
    rsbs: &RsbTable,
    members: &[u32],
    requester: u32,
    last_name: &[u8],
    max: usize,
) -> Vec<u8> {
    let mut names: Vec<Vec<u8>> = rsbs
        .snapshot()
        .into_iter()
        .filter(|rsb| rsb.body().master.is_local())
        .map(|rsb| rsb.name.clone())
        .filter(|name| dir_nodeid(name, members) == requester)
        .collect();
    names.sort();

    let mut out = Vec::with_capacity(max.min(4096));
    let mut buf = [0u8; NAME_RECORD_FIXED];
    for name in names {
        if !last_name.is_empty() && name.as_slice() <= last_name {
            continue;
        }
        if out.len() + 2 * NAME_RECORD_FIXED + name.len() > max {
            // End-of-block record; the peer will ask for the next page.
            LittleEndian::write_u32(&mut buf[0..4], 0);
            LittleEndian::write_u16(&mut buf[4..6], 0);
            out.extend_from_slice(&buf);
            return out;
        }
        // Records carry nodeid 0 meaning "the sending node"; the sender is
        // always the master of every name it reports.
        LittleEndian::write_u32(&mut buf[0..4], 0);
        LittleEndian::write_u16(&mut buf[4..6], name.len() as u16);
        out.extend_from_slice(&buf);
        out.extend_from_slice(&name);
    }
    // End-of-list record.
    LittleEndian::write_u32(&mut buf[0..4], 1);
    LittleEndian::write_u16(&mut buf[4..6], 0);
    out.extend_from_slice(&buf);
    out
}

/// Unpacks a names page. Records with nodeid 0 mean "the sending node".
pub fn unpack_names_page(sender: u32, data: &[u8]) -> (Vec<(u32, Vec<u8>)>, PageEnd) {
    let mut records = Vec::new();
    let mut at = 0;
    while at + NAME_RECORD_FIXED <= data.len() {
        let nodeid = LittleEndian::read_u32(&data[at..at + 4]);
        let length = LittleEndian::read_u16(&data[at + 4..at + 6]) as usize;
        at += NAME_RECORD_FIXED;
        if length == 0 {
            if nodeid != 0 {
                return (records, PageEnd::List);
            }
            return (records, PageEnd::Block);
        }
        if at + length > data.len() {
            tracing::warn!("truncated names page from {sender}");
            break;
        }
        let master = if nodeid == 0 { sender } else { nodeid };
        records.push((master, data[at..at + length].to_vec()));
        at += length;
    }
    (records, PageEnd::List)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rsb::MasterState;

    #[test]
    fn hash_is_stable() {
        assert_eq!(name_hash(b""), 0x811c_9dc5);
        assert_eq!(name_hash(b"a"), name_hash(b"a"));
        assert_ne!(name_hash(b"a"), name_hash(b"b"));
    }

    #[test]
    fn single_member_owns_everything() {
        assert_eq!(dir_nodeid(b"anything", &[7]), 7);
    }

    #[test]
    fn dir_node_stays_in_members() {
        let members = [1, 2, 5];
        for name in [&b"a"[..], b"bb", b"ccc", b"d-very-long-resource-name"] {
            assert!(members.contains(&dir_nodeid(name, &members)));
        }
    }

    #[test]
    fn first_lookup_wins() {
        let dir = Directory::new();
        assert_eq!(dir.lookup(b"r", 3), 3);
        assert_eq!(dir.lookup(b"r", 8), 3);
        assert_eq!(dir.get(b"r"), Some(3));
    }

    #[test]
    fn remove_checks_ownership() {
        let dir = Directory::new();
        dir.lookup(b"r", 3);
        dir.remove(b"r", 8);
        assert_eq!(dir.get(b"r"), Some(3));
        dir.remove(b"r", 3);
        assert_eq!(dir.get(b"r"), None);
    }

    #[test]
    fn names_pages_resume_and_terminate() {
        let rsbs = RsbTable::new();
        let members = [1u32];
        for name in [&b"aaa"[..], b"bbb", b"ccc"] {
            let rsb = rsbs.find_or_create(name, true).unwrap();
            rsb.body().master = MasterState::Local;
        }
        // A tiny page carries one record and an end-of-block marker.
        let page = pack_names_page(&rsbs, &members, 1, b"", 24);
        let (records, end) = unpack_names_page(2, &page);
        assert_eq!(end, PageEnd::Block);
        assert_eq!(records, vec![(2, b"aaa".to_vec())]);
        // Resume after the last name; a roomy page drains the rest.
        let page = pack_names_page(&rsbs, &members, 1, b"aaa", 4096);
        let (records, end) = unpack_names_page(2, &page);
        assert_eq!(end, PageEnd::List);
        assert_eq!(
            records,
            vec![(2, b"bbb".to_vec()), (2, b"ccc".to_vec())]
        );
    }
}
