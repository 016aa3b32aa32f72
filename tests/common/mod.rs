use std::sync::mpsc;
use std::time::Instant;

use vci_diagnostics::channel::{CanFrame, ChannelError, ChannelResult, PacketChannel};

/// In-memory CAN bus endpoint: frames written here come out of the peer.
pub struct EmuCanChannel {
    name: &'static str,
    in_queue: mpsc::Receiver<CanFrame>,
    out_queue: mpsc::Sender<CanFrame>,
}

impl EmuCanChannel {
    pub fn new(
        sender: mpsc::Sender<CanFrame>,
        receiver: mpsc::Receiver<CanFrame>,
        name: &'static str,
    ) -> Self {
        Self {
            name,
            in_queue: receiver,
            out_queue: sender,
        }
    }

    /// Two endpoints joined back to back.
    pub fn pair(a: &'static str, b: &'static str) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel();
        let (b_tx, a_rx) = mpsc::channel();
        (Self::new(a_tx, a_rx, a), Self::new(b_tx, b_rx, b))
    }
}

impl PacketChannel<CanFrame> for EmuCanChannel {
    fn open(&mut self) -> ChannelResult<()> {
        Ok(())
    }

    fn close(&mut self) -> ChannelResult<()> {
        Ok(())
    }

    fn write_packets(&mut self, packets: Vec<CanFrame>, _timeout_ms: u32) -> ChannelResult<()> {
        for p in packets {
            log::debug!("{} Out -> {p:02X?}", self.name);
            self.out_queue
                .send(p)
                .map_err(|_| ChannelError::InterfaceNotOpen)?;
        }
        Ok(())
    }

    fn read_packets(&mut self, max: usize, timeout_ms: u32) -> ChannelResult<Vec<CanFrame>> {
        let mut read = Vec::new();
        let start = Instant::now();
        loop {
            match self.in_queue.try_recv() {
                Ok(f) => {
                    log::debug!("{} In  -> {f:02X?}", self.name);
                    read.push(f);
                }
                Err(_) => {
                    if timeout_ms == 0 || start.elapsed().as_millis() > timeout_ms as u128 {
                        return Ok(read);
                    }
                    std::thread::sleep(std::time::Duration::from_millis(1));
                    continue;
                }
            }
            if read.len() == max {
                return Ok(read);
            }
        }
    }

    fn clear_rx_buffer(&mut self) -> ChannelResult<()> {
        while self.in_queue.try_recv().is_ok() {}
        Ok(())
    }

    fn clear_tx_buffer(&mut self) -> ChannelResult<()> {
        Ok(())
    }
}
