use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;
use crate::messaging::message::MessageEnvelope;
use crate::messaging::send_socket::SendSocket;


#[derive(Clone, Debug)]
pub struct SentDatagram {
    pub to: SocketAddr,
    pub data: Bytes,
    pub at: Instant,
}
impl SentDatagram {
    pub fn envelope(&self) -> MessageEnvelope {
        MessageEnvelope::deser(&self.data)
            .expect("sent datagram should be a valid envelope")
    }
}

/// A [SendSocket] that records everything that is sent through it, with a time stamp for
///  checking timing with tokio's paused clock
pub struct RecordingSendSocket {
    local_addr: SocketAddr,
    sent: Mutex<Vec<SentDatagram>>,
    failing: AtomicBool,
}

impl RecordingSendSocket {
    pub fn new(local_addr: SocketAddr) -> RecordingSendSocket {
        RecordingSendSocket {
            local_addr,
            sent: Default::default(),
            failing: AtomicBool::new(false),
        }
    }

    /// While failing, sends return an error and are not recorded
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentDatagram> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl SendSocket for RecordingSendSocket {
    async fn send_datagram(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("simulated send failure");
        }
        self.sent.lock().unwrap().push(SentDatagram {
            to,
            data: Bytes::copy_from_slice(buf),
            at: Instant::now(),
        });
        Ok(())
    }

    fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.local_addr)
    }
}
