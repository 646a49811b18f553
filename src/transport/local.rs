// in-process transport: one endpoint per simulated rank, wired together with
// crossbeam channels. each endpoint is meant to be moved onto its own thread.

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};

use super::{Envelope, Frame, MessageTag, PendingFrames, Transport, WireType};
use crate::error::{Error, Result};

pub struct LocalTransport {
    rank: usize,
    size: usize,
    inbox: Receiver<Frame>,
    peers: Vec<Sender<Frame>>,
    pending: PendingFrames,
}

/// creates `size` connected endpoints, index = rank.
pub fn local_cluster(size: usize) -> Vec<LocalTransport> {
    let (senders, receivers): (Vec<_>, Vec<_>) = (0..size).map(|_| unbounded()).unzip();

    receivers
        .into_iter()
        .enumerate()
        .map(|(rank, inbox)| LocalTransport {
            rank,
            size,
            inbox,
            peers: senders.clone(),
            pending: PendingFrames::default(),
        })
        .collect()
}

impl LocalTransport {
    // moves everything that has arrived so far into the pending queues.
    fn drain_inbox(&mut self) {
        loop {
            match self.inbox.try_recv() {
                Ok(frame) => self.pending.push(frame),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }
}

impl Transport for LocalTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn send(
        &mut self,
        dest: usize,
        tag: MessageTag,
        wire_type: WireType,
        payload: &[u8],
    ) -> Result<()> {
        let peer = self.peers.get(dest).ok_or_else(|| {
            Error::Transport(format!(
                "process {} does not exist in a run of {} processes",
                dest, self.size
            ))
        })?;
        let frame = Frame {
            source: self.rank,
            tag,
            wire_type,
            payload: payload.to_vec(),
        };
        peer.send(frame)
            .map_err(|_| Error::Transport(format!("process {} has shut down", dest)))
    }

    fn probe(&mut self, source: usize, tag: MessageTag) -> Result<Option<Envelope>> {
        self.drain_inbox();
        Ok(self.pending.peek(source, tag))
    }

    fn receive(
        &mut self,
        source: usize,
        tag: MessageTag,
        on_payload: &mut dyn FnMut(&[u8]) -> Result<()>,
    ) -> Result<()> {
        self.drain_inbox();
        self.pending.take_with(source, tag, on_payload)
    }
}
