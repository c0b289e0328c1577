//! smoltcp device backed by in-memory packet queues.
//!
//! The driver fills `rx_queue` from the NIC's reader before each poll and
//! collects everything the interface emitted from `tx_queue` afterwards, so
//! the interface itself never touches the overlay.

use crate::packet::PacketView;
use bytes::Bytes;
use smoltcp::phy::{self, DeviceCapabilities, Medium};
use smoltcp::time::Instant;
use std::collections::VecDeque;

/// IP-medium device feeding smoltcp from queued datagrams
#[derive(Debug)]
pub(crate) struct OverlayDevice {
    mtu: usize,
    rx_queue: VecDeque<Bytes>,
    tx_queue: Vec<PacketView>,
}

impl OverlayDevice {
    pub(crate) fn new(mtu: usize) -> Self {
        Self {
            mtu,
            rx_queue: VecDeque::new(),
            tx_queue: Vec::new(),
        }
    }

    pub(crate) fn push_rx(&mut self, packets: impl IntoIterator<Item = Bytes>) {
        self.rx_queue.extend(packets);
    }

    pub(crate) fn has_pending_rx(&self) -> bool {
        !self.rx_queue.is_empty()
    }

    /// Everything emitted since the last call, in emission order
    pub(crate) fn take_tx(&mut self) -> Vec<PacketView> {
        std::mem::take(&mut self.tx_queue)
    }
}

pub(crate) struct OverlayRxToken {
    packet: Bytes,
}

impl phy::RxToken for OverlayRxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(&self.packet)
    }
}

pub(crate) struct OverlayTxToken<'a> {
    queue: &'a mut Vec<PacketView>,
}

impl phy::TxToken for OverlayTxToken<'_> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buf = vec![0u8; len];
        let result = f(&mut buf);
        self.queue.push(PacketView::new(buf));
        result
    }
}

impl phy::Device for OverlayDevice {
    type RxToken<'a> = OverlayRxToken;
    type TxToken<'a> = OverlayTxToken<'a>;

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let packet = self.rx_queue.pop_front()?;
        Some((
            OverlayRxToken { packet },
            OverlayTxToken {
                queue: &mut self.tx_queue,
            },
        ))
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        Some(OverlayTxToken {
            queue: &mut self.tx_queue,
        })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = self.mtu;
        caps
    }
}
