use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Notify};
use crate::socket::DatagramSocket;

/// An in-memory [DatagramSocket]: tests inject inbound datagrams and inspect what was sent
pub struct MemorySocket {
    local_addr: SocketAddr,
    inbound_sender: mpsc::UnboundedSender<(Bytes, SocketAddr)>,
    inbound_receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Bytes, SocketAddr)>>,
    sent: Mutex<Vec<(SocketAddr, Bytes)>>,
    sent_notify: Notify,
}

impl MemorySocket {
    pub fn new(local_addr: SocketAddr) -> MemorySocket {
        let (inbound_sender, inbound_receiver) = mpsc::unbounded_channel();
        MemorySocket {
            local_addr,
            inbound_sender,
            inbound_receiver: tokio::sync::Mutex::new(inbound_receiver),
            sent: Default::default(),
            sent_notify: Notify::new(),
        }
    }

    /// delivers a datagram to whoever is receiving on this socket
    pub fn inject(&self, from: SocketAddr, datagram: impl Into<Bytes>) {
        let _ = self.inbound_sender.send((datagram.into(), from));
    }

    /// removes and returns everything sent so far
    pub fn take_sent(&self) -> Vec<(SocketAddr, Bytes)> {
        std::mem::take(&mut *self.sent.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn num_sent(&self) -> usize {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// waits until at least one datagram was sent since the last call to [MemorySocket::take_sent]
    pub async fn wait_for_sent(&self) {
        loop {
            let notified = self.sent_notify.notified();
            if self.num_sent() > 0 {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl DatagramSocket for MemorySocket {
    async fn send_datagram(&self, to: SocketAddr, datagram: &[u8]) {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).push((to, Bytes::copy_from_slice(datagram)));
        self.sent_notify.notify_waiters();
    }

    async fn recv_datagram(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        let received = self.inbound_receiver.lock().await.recv().await;
        match received {
            Some((datagram, from)) => {
                let len = datagram.len().min(buf.len());
                buf[..len].copy_from_slice(&datagram[..len]);
                Ok((len, from))
            }
            None => Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "memory socket closed")),
        }
    }

    fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.local_addr)
    }
}
