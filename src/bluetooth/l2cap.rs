//! L2CAP socket implementation for `AirPods` communication.
//!
//! A connected socket is split into a receive task and a send task, both
//! spawned on the caller's [`JoinSet`]. The session talks to them through
//! [`L2CapReceiver`] and [`L2CapSender`].

use std::sync::Arc;

use bluer::{
   Address, AddressType,
   l2cap::{SeqPacket, Socket, SocketAddr},
};
use log::{debug, warn};
use smallvec::SmallVec;
use tokio::{
   sync::{mpsc, oneshot},
   task::JoinSet,
};

use crate::{
   airpods::protocol::hex_preview,
   error::{AirPodsError, Result},
};

pub type Packet = SmallVec<[u8; 32]>;

/// PSM (Protocol Service Multiplexer) for the `AirPods` control channel
pub const PSM_CONTROL: u16 = 0x1001;
/// One read is at most this many bytes; longer datagrams are truncated.
pub const MAX_PACKET_SIZE: usize = 1024;

pub(crate) enum Command {
   Send {
      data: Packet,
      then: oneshot::Sender<Result<()>>,
   },
}

/// Receiver half of an L2CAP connection.
#[derive(Debug)]
pub struct L2CapReceiver {
   rx: mpsc::Receiver<Result<Packet>>,
}

impl L2CapReceiver {
   /// Waits for the next frame. Peer close and transport errors are
   /// returned as errors; after one of them no further frames arrive.
   pub async fn recv(&mut self) -> Result<Packet> {
      self.rx.recv().await.ok_or(AirPodsError::PeerClosed)?
   }
}

/// Sender half of an L2CAP connection.
///
/// This type is cheaply cloneable.
#[derive(Debug, Clone)]
pub struct L2CapSender {
   tx: mpsc::Sender<Command>,
}

impl L2CapSender {
   pub fn is_connected(&self) -> bool {
      !self.tx.is_closed()
   }

   /// Writes one frame and waits for the socket to accept it.
   pub async fn send(&self, data: &[u8]) -> Result<()> {
      if !self.is_connected() {
         return Err(AirPodsError::DeviceNotConnected);
      }

      let (tx, rx) = oneshot::channel();
      self
         .tx
         .send(Command::Send {
            data: Packet::from_slice(data),
            then: tx,
         })
         .await
         .map_err(|_| AirPodsError::DeviceNotConnected)?;

      rx.await.map_err(|_| AirPodsError::DeviceNotConnected)?
   }
}

/// Opens a sequential-packet L2CAP socket to `address` on [`PSM_CONTROL`].
///
/// There is no timeout; the call completes when the kernel reports success
/// or failure.
pub async fn connect(
   jset: &mut JoinSet<()>,
   address: Address,
) -> Result<(L2CapReceiver, L2CapSender)> {
   debug!("Creating L2CAP socket for {address}");

   let socket = Socket::new_seq_packet().map_err(AirPodsError::ConnectFailed)?;
   let addr = SocketAddr::new(address, AddressType::BrEdr, PSM_CONTROL);
   debug!("Connecting to {address}:{PSM_CONTROL:#06x}");

   let seq_packet = socket.connect(addr).await.map_err(AirPodsError::ConnectFailed)?;

   let (cmd_tx, cmd_rx) = mpsc::channel(128);
   let (in_tx, in_rx) = mpsc::channel(128);

   let seq_packet = Arc::new(seq_packet);
   jset.spawn(recv_thread(address, in_tx, seq_packet.clone()));
   jset.spawn(send_thread(address, cmd_rx, seq_packet));

   Ok((L2CapReceiver { rx: in_rx }, L2CapSender { tx: cmd_tx }))
}

async fn recv_thread(adr: Address, tx: mpsc::Sender<Result<Packet>>, sp: Arc<SeqPacket>) {
   let mut stack = [0u8; MAX_PACKET_SIZE];
   loop {
      let item = match sp.recv(&mut stack).await {
         Ok(0) => {
            warn!("{adr}: connection closed by peer");
            Err(AirPodsError::PeerClosed)
         },
         Ok(n) => {
            let recvd = &stack[..n];
            debug!("← {adr}: {}", hex_preview(recvd));
            Ok(Packet::from_slice(recvd))
         },
         Err(e) => {
            warn!("{adr}: receive failed: {e}");
            Err(AirPodsError::Io(e))
         },
      };
      let last = item.is_err();
      if tx.send(item).await.is_err() || last {
         return;
      }
   }
}

async fn send_thread(adr: Address, mut rx: mpsc::Receiver<Command>, sp: Arc<SeqPacket>) {
   while let Some(cmd) = rx.recv().await {
      match cmd {
         Command::Send { data, then } => {
            debug!("→ {adr}: {}", hex::encode(&data));
            if let Err(e) = sp.send(&data).await {
               warn!("{adr}: send failed: {e}");
               let _ = then.send(Err(AirPodsError::SendFailed(e)));
            } else {
               _ = then.send(Ok(()));
            }
         },
      }
   }
   debug!("{adr}: send task finished");
}
