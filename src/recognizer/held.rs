//! Packets held back while an utterance still owes output.

use crate::pipeline::packet::{Packet, StreamTime};
use std::collections::VecDeque;

/// Time-ordered buffer of non-observation packets.
///
/// Input arrives in time order, so pushes normally append; an out-of-order
/// packet is inserted after every packet with the same or an earlier start.
#[derive(Debug, Default)]
pub struct HeldPackets {
    packets: VecDeque<Packet>,
}

impl HeldPackets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hold(&mut self, packet: Packet) {
        let at = self
            .packets
            .iter()
            .rposition(|p| p.start() <= packet.start())
            .map_or(0, |i| i + 1);
        self.packets.insert(at, packet);
    }

    /// Removes packets starting strictly before `time`.
    pub fn release_before(&mut self, time: StreamTime) -> Vec<Packet> {
        self.release_while(|p| p.start() < time)
    }

    /// Removes packets starting at or before `time`.
    pub fn release_through(&mut self, time: StreamTime) -> Vec<Packet> {
        self.release_while(|p| p.start() <= time)
    }

    /// Removes everything.
    pub fn release_all(&mut self) -> Vec<Packet> {
        self.packets.drain(..).collect()
    }

    fn release_while(&mut self, ready: impl Fn(&Packet) -> bool) -> Vec<Packet> {
        let n = self.packets.iter().take_while(|p| ready(p)).count();
        self.packets.drain(..n).collect()
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }
}
