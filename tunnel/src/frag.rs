//! IPv4 reassembly and refragmentation.
//!
//! Captured fragments are reassembled before encapsulation (RFC 791
//! grouping by source, destination, protocol and identification). The
//! original fragmentation pattern travels through the tunnel as a
//! [`Fingerprint`] so the emitting side can slice the datagram back into
//! exactly the boundaries and identification the source produced. MTU
//! artifacts must not change across the tunnel: applications fingerprint
//! on IPv4 ID patterns, and path MTU discovery breaks if boundaries move.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use ip_packet::IpPacket;

use crate::Error;

/// Incomplete groups are dropped after this long.
pub const REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(30);

/// The fragmentation identity of one original datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    /// Original IPv4 identification.
    pub id: u16,
    pub dont_fragment: bool,
    /// Whether the last observed fragment still had MF set.
    pub mf_on_last: bool,
    pub fragmented: bool,
    /// Original fragment offsets in 8-byte units, ascending. Empty unless
    /// `fragmented`.
    pub offsets: Vec<u16>,
}

impl Fingerprint {
    /// The fingerprint of a datagram that arrived in one piece.
    pub fn passthrough(packet: &IpPacket) -> Self {
        Self {
            id: packet.identification(),
            dont_fragment: packet.dont_fragment(),
            mf_on_last: false,
            fragmented: false,
            offsets: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct GroupKey {
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    id: u16,
}

#[derive(Debug)]
struct Fragment {
    /// Byte offset within the reassembled payload.
    offset: usize,
    payload: Vec<u8>,
    more_fragments: bool,
}

#[derive(Debug)]
struct Group {
    /// In arrival order; on overlap the later fragment wins.
    fragments: Vec<Fragment>,
    /// IP header of the offset-0 fragment.
    header: Option<Vec<u8>>,
    dont_fragment: bool,
    deadline: Instant,
}

/// Per-flow fragment buffering.
pub struct FragmentQueue {
    groups: HashMap<GroupKey, Group>,
    timeout: Duration,
}

impl Default for FragmentQueue {
    fn default() -> Self {
        Self::new(REASSEMBLY_TIMEOUT)
    }
}

impl FragmentQueue {
    pub fn new(timeout: Duration) -> Self {
        Self {
            groups: HashMap::new(),
            timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Feeds one captured datagram through the queue.
    ///
    /// Unfragmented datagrams pass straight through. A fragment is parked
    /// until its group completes, at which point the reassembled datagram
    /// and its fingerprint come back.
    pub fn push(
        &mut self,
        packet: IpPacket,
        now: Instant,
    ) -> Result<Option<(IpPacket, Fingerprint)>, Error> {
        if !packet.is_fragment() {
            let fingerprint = Fingerprint::passthrough(&packet);
            return Ok(Some((packet, fingerprint)));
        }

        let key = GroupKey {
            src: packet.source(),
            dst: packet.destination(),
            protocol: packet.protocol().0,
            id: packet.identification(),
        };

        let group = self.groups.entry(key).or_insert_with(|| Group {
            fragments: Vec::new(),
            header: None,
            dont_fragment: false,
            deadline: now + self.timeout,
        });

        if packet.fragment_offset() == 0 {
            group.header = Some(packet.packet()[..packet.header_len()].to_vec());
            group.dont_fragment = packet.dont_fragment();
        }

        group.fragments.push(Fragment {
            offset: packet.fragment_offset() as usize * 8,
            payload: packet.payload().to_vec(),
            more_fragments: packet.more_fragments(),
        });

        match try_assemble(group) {
            Ok(Some(assembled)) => {
                self.groups.remove(&key);
                Ok(Some(assembled))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                self.groups.remove(&key);
                Err(e)
            }
        }
    }

    /// Drops groups whose reassembly deadline passed.
    pub fn handle_timeout(&mut self, now: Instant) {
        self.groups.retain(|key, group| {
            if now < group.deadline {
                return true;
            }

            tracing::warn!(
                src = %key.src,
                dst = %key.dst,
                id = key.id,
                fragments = group.fragments.len(),
                "Reassembly timed out, dropping partial datagram"
            );

            false
        });
    }
}

fn try_assemble(group: &Group) -> Result<Option<(IpPacket, Fingerprint)>, Error> {
    // The end of the datagram is wherever a fragment without MF says it is.
    let mut total: Option<usize> = None;
    for fragment in group.fragments.iter().filter(|f| !f.more_fragments) {
        let end = fragment.offset + fragment.payload.len();

        if let Some(previous) = total {
            if previous != end {
                return Err(Error::Reassembly(format!(
                    "two final fragments claim different lengths ({previous} and {end})"
                )));
            }
        }

        total = Some(end);
    }

    let Some(total) = total else {
        return Ok(None); // Last fragment still missing.
    };

    let Some(header) = &group.header else {
        return Ok(None); // First fragment still missing.
    };

    // Contiguity over [0, total).
    let mut intervals: Vec<(usize, usize)> = group
        .fragments
        .iter()
        .map(|f| (f.offset, f.offset + f.payload.len()))
        .collect();
    intervals.sort_unstable();

    let mut covered = 0;
    for (start, end) in intervals {
        if start > covered {
            return Ok(None); // Gap; keep waiting.
        }
        covered = covered.max(end);
    }

    if covered < total {
        return Ok(None);
    }
    if covered > total {
        return Err(Error::Reassembly(format!(
            "fragments extend to {covered} past the final fragment at {total}"
        )));
    }

    // Write in arrival order so the later fragment wins overlapped bytes.
    let mut payload = vec![0u8; total];
    for fragment in &group.fragments {
        payload[fragment.offset..fragment.offset + fragment.payload.len()]
            .copy_from_slice(&fragment.payload);
    }

    let mut offsets: Vec<u16> = group
        .fragments
        .iter()
        .map(|f| (f.offset / 8) as u16)
        .collect();
    offsets.sort_unstable();
    offsets.dedup();

    let mf_on_last = group
        .fragments
        .iter()
        .max_by_key(|f| f.offset)
        .map(|f| f.more_fragments)
        .unwrap_or(false);

    // The reassembled header announces the full length and no fragmentation.
    let mut buf = [header.as_slice(), &payload].concat();
    let total_len = (header.len() + total) as u16;
    buf[2..4].copy_from_slice(&total_len.to_be_bytes());

    let mut datagram = IpPacket::new(buf)
        .map_err(|e| Error::Reassembly(format!("reassembled datagram is malformed: {e:#}")))?;
    datagram.set_fragment_fields(0, false, group.dont_fragment);
    datagram.update_checksum();

    let fingerprint = Fingerprint {
        id: datagram.identification(),
        dont_fragment: group.dont_fragment,
        mf_on_last,
        fragmented: true,
        offsets,
    };

    Ok(Some((datagram, fingerprint)))
}

/// Slices a datagram back into its original fragments.
///
/// The emitted fragments carry the fingerprint's identification and
/// boundaries; MF is set on all but the last. For an unfragmented
/// fingerprint the datagram passes through untouched.
pub fn refragment(packet: &IpPacket, fingerprint: &Fingerprint) -> Result<Vec<IpPacket>, Error> {
    if !fingerprint.fragmented {
        return Ok(vec![packet.clone()]);
    }

    let offsets = &fingerprint.offsets;

    let valid = !offsets.is_empty()
        && offsets[0] == 0
        && offsets.windows(2).all(|w| w[0] < w[1])
        && (offsets[offsets.len() - 1] as usize * 8) < packet.payload().len();
    if !valid {
        return Err(Error::Reassembly(format!(
            "fingerprint offsets {offsets:?} do not match a {} byte payload",
            packet.payload().len()
        )));
    }

    let header = &packet.packet()[..packet.header_len()];
    let payload = packet.payload();

    let mut fragments = Vec::with_capacity(offsets.len());

    for (i, &offset) in offsets.iter().enumerate() {
        let start = offset as usize * 8;
        let end = offsets
            .get(i + 1)
            .map(|&next| next as usize * 8)
            .unwrap_or(payload.len());
        let last = i + 1 == offsets.len();

        let mut buf = [header, &payload[start..end]].concat();
        buf[2..4].copy_from_slice(&((header.len() + end - start) as u16).to_be_bytes());

        let mut fragment = IpPacket::new(buf)
            .map_err(|e| Error::Reassembly(format!("fragment slice is malformed: {e:#}")))?;

        fragment.set_identification(fingerprint.id);
        fragment.set_fragment_fields(
            offset,
            !last || fingerprint.mf_on_last,
            fingerprint.dont_fragment,
        );
        fragment.update_checksum();

        fragments.push(fragment);
    }

    Ok(fragments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use etherparse::IpNumber;
    use ip_packet::make;

    const SRC: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
    const DST: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);

    /// An ICMP echo datagram too big for a 1500-byte MTU, split the way a
    /// kernel would split it.
    fn two_fragments() -> (IpPacket, IpPacket) {
        let whole = make::icmp_request_packet(SRC, DST, 1, 42, &[0xab; 2980]);
        let payload = whole.payload().to_vec();

        let first = make::fragment(SRC, DST, IpNumber::ICMP, 913, 0, true, &payload[..1480]);
        let second = make::fragment(SRC, DST, IpNumber::ICMP, 913, 185, false, &payload[1480..]);

        (first, second)
    }

    #[test]
    fn reassembles_out_of_order_fragments() {
        let _guard = ikago_logging::test("debug");

        let (first, second) = two_fragments();
        let mut queue = FragmentQueue::default();
        let now = Instant::now();

        assert!(queue.push(second, now).unwrap().is_none());
        let (datagram, fingerprint) = queue.push(first, now).unwrap().unwrap();

        assert_eq!(datagram.payload().len(), 2988);
        assert!(!datagram.is_fragment());
        assert_eq!(datagram.identification(), 913);
        assert!(queue.is_empty());

        assert_eq!(
            fingerprint,
            Fingerprint {
                id: 913,
                dont_fragment: false,
                mf_on_last: false,
                fragmented: true,
                offsets: vec![0, 185],
            }
        );
    }

    #[test]
    fn unfragmented_datagram_passes_through() {
        let mut queue = FragmentQueue::default();

        let packet = make::udp_packet(SRC, DST, 1234, 53, b"query");
        let (out, fingerprint) = queue
            .push(packet.clone(), Instant::now())
            .unwrap()
            .unwrap();

        assert_eq!(out, packet);
        assert!(!fingerprint.fragmented);
        assert!(queue.is_empty());
    }

    #[test]
    fn later_fragment_wins_overlap() {
        let mut queue = FragmentQueue::default();
        let now = Instant::now();

        assert!(queue
            .push(
                make::fragment(SRC, DST, IpNumber::UDP, 7, 0, true, &[0x11; 16]),
                now
            )
            .unwrap()
            .is_none());

        // Overlaps the first fragment's last 8 bytes.
        let (datagram, _) = queue
            .push(
                make::fragment(SRC, DST, IpNumber::UDP, 7, 1, false, &[0x22; 16]),
                now,
            )
            .unwrap()
            .unwrap();

        assert_eq!(datagram.payload().len(), 24);
        assert_eq!(&datagram.payload()[..8], &[0x11; 8]);
        assert_eq!(&datagram.payload()[8..], &[0x22; 16]);
    }

    #[test]
    fn incomplete_group_expires() {
        let _guard = ikago_logging::test("debug");

        let mut queue = FragmentQueue::default();
        let now = Instant::now();

        let (first, _) = two_fragments();
        assert!(queue.push(first, now).unwrap().is_none());
        assert_eq!(queue.len(), 1);

        queue.handle_timeout(now + REASSEMBLY_TIMEOUT);
        assert!(queue.is_empty());
    }

    #[test]
    fn conflicting_final_fragments_are_an_error() {
        let mut queue = FragmentQueue::default();
        let now = Instant::now();

        queue
            .push(
                make::fragment(SRC, DST, IpNumber::UDP, 9, 1, false, &[0u8; 8]),
                now,
            )
            .unwrap();

        let result = queue.push(
            make::fragment(SRC, DST, IpNumber::UDP, 9, 2, false, &[0u8; 8]),
            now,
        );

        assert!(matches!(result, Err(Error::Reassembly(_))));
        assert!(queue.is_empty());
    }

    #[test]
    fn refragment_restores_original_boundaries_and_id() {
        let (first, second) = two_fragments();
        let original: Vec<IpPacket> = vec![first.clone(), second.clone()];

        let mut queue = FragmentQueue::default();
        let now = Instant::now();
        queue.push(first, now).unwrap();
        let (datagram, fingerprint) = queue.push(second, now).unwrap().unwrap();

        let fragments = refragment(&datagram, &fingerprint).unwrap();

        assert_eq!(fragments.len(), 2);
        for (restored, original) in fragments.iter().zip(&original) {
            assert_eq!(restored.identification(), original.identification());
            assert_eq!(restored.fragment_offset(), original.fragment_offset());
            assert_eq!(restored.more_fragments(), original.more_fragments());
            assert_eq!(restored.payload(), original.payload());
        }
    }

    #[test]
    fn refragment_rejects_offsets_past_the_payload() {
        let packet = make::udp_packet(SRC, DST, 1, 2, &[0u8; 64]);
        let fingerprint = Fingerprint {
            id: 1,
            dont_fragment: false,
            mf_on_last: false,
            fragmented: true,
            offsets: vec![0, 4000],
        };

        assert!(matches!(
            refragment(&packet, &fingerprint),
            Err(Error::Reassembly(_))
        ));
    }
}
