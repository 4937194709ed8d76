use std::collections::VecDeque;

/// An in-memory device for [`smoltcp`] that is entirely backed by buffers.
///
/// Inbound packets are fed in by the stack task, outbound packets are drained
/// towards the transport after every interface poll.
#[derive(Debug)]
pub struct InMemoryDevice {
    mtu: usize,
    inbound_packets: VecDeque<Vec<u8>>,
    outbound_packets: VecDeque<Vec<u8>>,
}

impl InMemoryDevice {
    pub fn new(mtu: usize) -> Self {
        Self {
            mtu,
            inbound_packets: VecDeque::new(),
            outbound_packets: VecDeque::new(),
        }
    }

    pub fn receive(&mut self, packet: Vec<u8>) {
        self.inbound_packets.push_back(packet);
    }

    pub fn next_send(&mut self) -> Option<Vec<u8>> {
        self.outbound_packets.pop_front()
    }
}

impl smoltcp::phy::Device for InMemoryDevice {
    type RxToken<'a> = SmolRxToken;
    type TxToken<'a> = SmolTxToken<'a>;

    fn receive(
        &mut self,
        _timestamp: smoltcp::time::Instant,
    ) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let rx_token = SmolRxToken {
            packet: self.inbound_packets.pop_front()?,
        };
        let tx_token = SmolTxToken {
            outbound_packets: &mut self.outbound_packets,
        };

        Some((rx_token, tx_token))
    }

    fn transmit(&mut self, _timestamp: smoltcp::time::Instant) -> Option<Self::TxToken<'_>> {
        Some(SmolTxToken {
            outbound_packets: &mut self.outbound_packets,
        })
    }

    fn capabilities(&self) -> smoltcp::phy::DeviceCapabilities {
        let mut caps = smoltcp::phy::DeviceCapabilities::default();
        caps.medium = smoltcp::phy::Medium::Ip;
        caps.max_transmission_unit = self.mtu;

        caps
    }
}

pub struct SmolTxToken<'a> {
    outbound_packets: &'a mut VecDeque<Vec<u8>>,
}

impl smoltcp::phy::TxToken for SmolTxToken<'_> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut packet = vec![0u8; len];
        let result = f(&mut packet);

        self.outbound_packets.push_back(packet);

        result
    }
}

pub struct SmolRxToken {
    packet: Vec<u8>,
}

impl smoltcp::phy::RxToken for SmolRxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(&self.packet)
    }
}
