//! Per-PeerPair packet counters: bytes and datagram counts split by
//! channel vs. direct framing, plus bytes dropped to queue expiry.

#[derive(Clone, Debug, Default)]
pub struct PacketStats {
    pub in_packets: u64,
    pub in_bytes: u64,
    pub in_packets_channel: u64,
    pub in_bytes_channel: u64,
    pub out_packets: u64,
    pub out_bytes: u64,
    pub out_packets_channel: u64,
    pub out_bytes_channel: u64,
    pub out_expired_messages: u64,
    pub out_expired_bytes: u64,
}

impl PacketStats {
    pub fn add_in(&mut self, bytes: u64, channel: bool) {
        self.in_packets += 1;
        self.in_bytes += bytes;
        if channel {
            self.in_packets_channel += 1;
            self.in_bytes_channel += bytes;
        }
    }

    pub fn add_out(&mut self, bytes: u64, channel: bool) {
        self.out_packets += 1;
        self.out_bytes += bytes;
        if channel {
            self.out_packets_channel += 1;
            self.out_bytes_channel += bytes;
        }
    }

    pub fn add_expired(&mut self, bytes: u64) {
        self.out_expired_messages += 1;
        self.out_expired_bytes += bytes;
    }
}
