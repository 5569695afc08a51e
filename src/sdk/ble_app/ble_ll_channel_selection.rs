use heapless::Vec;

pub const BLE_DATA_CHANNEL_COUNT: usize = 37;

/// Table of used data channels built from a 37 bit channel map.
///
/// # Algorithm
/// Scans data channels 0..=36 and records every channel whose bit is set in the map, in
/// ascending order. The resulting table is indexed by the remapping step of Channel
/// Selection Algorithm #2.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChanTable {
    map: u64,
    used: Vec<u8, BLE_DATA_CHANNEL_COUNT>,
}

impl ChanTable {
    pub fn new(chan_map: u64) -> Self {
        let mut used = Vec::new();
        for chan in 0..BLE_DATA_CHANNEL_COUNT {
            if chan_map & (1u64 << chan) != 0 {
                // Capacity equals the number of data channels
                let _ = used.push(chan as u8);
            }
        }

        Self { map: chan_map, used }
    }

    pub fn map(&self) -> u64 {
        self.map
    }

    pub fn num_used(&self) -> usize {
        self.used.len()
    }

    pub fn is_used(&self, chan: u8) -> bool {
        (chan as usize) < BLE_DATA_CHANNEL_COUNT && self.map & (1u64 << chan) != 0
    }

    fn index_of(&self, chan: u8) -> usize {
        self.used.iter().position(|c| *c == chan).unwrap_or(0)
    }

    fn at(&self, idx: usize) -> u8 {
        self.used.get(idx).copied().unwrap_or(0)
    }
}

/// Reverses the bit order within each octet.
fn perm(v: u16) -> u16 {
    let lo = (v as u8).reverse_bits() as u16;
    let hi = ((v >> 8) as u8).reverse_bits() as u16;
    lo | (hi << 8)
}

/// Multiply, add and modulo 2^16.
fn mam(a: u16, b: u16) -> u16 {
    a.wrapping_mul(17).wrapping_add(b)
}

/// Unmapped pseudo random number `prn_s` for an event counter.
fn prn_s(counter: u16, chan_id: u16) -> u16 {
    let mut u = counter ^ chan_id;
    for _ in 0..3 {
        u = mam(perm(u), chan_id);
    }
    u
}

/// Channel identifier of a BIS or of the BIG control subevent.
pub fn chan_identifier(access_addr: u32) -> u16 {
    ((access_addr >> 16) as u16) ^ (access_addr as u16)
}

/// Per-stream Channel Selection Algorithm #2 state.
///
/// # Algorithm
/// At the start of every BIG event the event channel is derived from the event counter:
/// 1. `prn_e = prn_s ^ chan_id`, where `prn_s` is three PERM/MAM rounds over
///    `counter ^ chan_id`
/// 2. The unmapped channel is `prn_e mod 37`; when unused it is remapped to
///    `table[(N * prn_e) >> 16]`
///
/// Every further subevent of the same event hops from the previously used table index by
/// a distance of at least `d`, keeping consecutive subevents apart on the band.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BisChanState {
    pub chan_id: u16,
    prn_lu: u16,
    last_idx: usize,
    pub chan: u8,
}

impl BisChanState {
    pub fn new(access_addr: u32) -> Self {
        Self { chan_id: chan_identifier(access_addr), ..Default::default() }
    }

    /// Selects and returns the channel of subevent 0 for `counter`.
    pub fn event_start(&mut self, table: &ChanTable, counter: u16) -> u8 {
        let s = prn_s(counter, self.chan_id);
        let e = s ^ self.chan_id;
        let unmapped = (e % BLE_DATA_CHANNEL_COUNT as u16) as u8;

        if table.is_used(unmapped) || table.num_used() == 0 {
            self.chan = unmapped;
            self.last_idx = table.index_of(unmapped);
        } else {
            self.last_idx = (table.num_used() * e as usize) >> 16;
            self.chan = table.at(self.last_idx);
        }
        self.prn_lu = s;

        self.chan
    }

    /// Hops to the channel of the next subevent in the current event.
    pub fn next_subevent(&mut self, table: &ChanTable) -> u8 {
        let n = table.num_used() as i32;
        if n == 0 {
            return self.chan;
        }

        self.prn_lu = mam(perm(self.prn_lu), self.chan_id);
        let se = (self.prn_lu ^ self.chan_id) as i32;

        let d = 1.max((n - 5).min(3).max(((n - 10) / 2).min(11)));
        let span = (n - 2 * d + 1).max(0);
        let idx = (self.last_idx as i32 + d + ((se * span) >> 16)) % n;

        self.last_idx = idx as usize;
        self.chan = table.at(self.last_idx);

        self.chan
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_CHANNELS: u64 = 0x1F_FFFF_FFFF;
    // Channels 9, 10, 21, 22, 23, 33, 34, 35 and 36
    const NINE_CHANNELS: u64 = 0x1E_00E0_0600;
    const SAMPLE_AA: u32 = 0x8E89_BED6;

    #[test]
    fn test_chan_table_all_channels() {
        // Arrange
        let table = ChanTable::new(ALL_CHANNELS);

        // Assert
        assert_eq!(table.num_used(), 37);
        for chan in 0..37 {
            assert!(table.is_used(chan));
            assert_eq!(table.at(chan as usize), chan);
        }
        assert!(!table.is_used(37));
    }

    #[test]
    fn test_chan_table_selective_channels() {
        // Arrange
        let table = ChanTable::new(NINE_CHANNELS);

        // Assert
        assert_eq!(table.num_used(), 9);
        assert_eq!(table.at(0), 9);
        assert_eq!(table.at(8), 36);
        assert_eq!(table.index_of(21), 2);
    }

    #[test]
    fn test_perm_reverses_each_octet() {
        assert_eq!(perm(0x0001), 0x0080);
        assert_eq!(perm(0x8001), 0x0180);
        assert_eq!(perm(0x305F), 0x0CFA);
    }

    #[test]
    fn test_chan_identifier() {
        assert_eq!(chan_identifier(SAMPLE_AA), 0x305F);
    }

    #[test]
    fn test_event_channel_all_channels() {
        // Arrange
        let table = ChanTable::new(ALL_CHANNELS);
        let mut state = BisChanState::new(SAMPLE_AA);

        // Act / Assert
        let expected = [25, 20, 6, 21];
        for (counter, chan) in expected.iter().enumerate() {
            assert_eq!(state.event_start(&table, counter as u16), *chan);
        }
    }

    #[test]
    fn test_event_channel_remapped() {
        // Arrange
        let table = ChanTable::new(NINE_CHANNELS);
        let mut state = BisChanState::new(SAMPLE_AA);

        // Act / Assert
        let expected = [35, 9, 33, 21];
        for (counter, chan) in expected.iter().enumerate() {
            assert_eq!(state.event_start(&table, counter as u16), *chan);
        }
    }

    #[test]
    fn test_subevent_hopping() {
        // Arrange
        let table = ChanTable::new(ALL_CHANNELS);
        let mut state = BisChanState::new(SAMPLE_AA);

        // Act
        let first = state.event_start(&table, 0);
        let hops = [state.next_subevent(&table), state.next_subevent(&table), state.next_subevent(&table)];

        // Assert
        assert_eq!(first, 25);
        assert_eq!(hops, [1, 16, 36]);
    }

    #[test]
    fn test_subevent_hopping_remapped() {
        // Arrange
        let table = ChanTable::new(NINE_CHANNELS);
        let mut state = BisChanState::new(SAMPLE_AA);

        // Act
        let first = state.event_start(&table, 0);
        let hops = [state.next_subevent(&table), state.next_subevent(&table), state.next_subevent(&table)];

        // Assert
        assert_eq!(first, 35);
        assert_eq!(hops, [10, 33, 10]);
        for chan in hops {
            assert!(table.is_used(chan));
        }
    }

    #[test]
    fn test_event_start_restarts_hop_sequence() {
        let table = ChanTable::new(ALL_CHANNELS);
        let mut state = BisChanState::new(SAMPLE_AA);

        state.event_start(&table, 0);
        state.next_subevent(&table);
        state.next_subevent(&table);

        assert_eq!(state.event_start(&table, 0), 25);
        assert_eq!(state.next_subevent(&table), 1);
    }
}
