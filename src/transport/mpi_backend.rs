// mpi transport, compiled with the `mpi` feature. payloads travel as raw
// bytes with the message tag as the mpi tag, so per-(source, tag) ordering
// comes from mpi's non-overtaking guarantee. single threaded use only, mpi
// is initialised without thread-multiple support.

use mpi::environment::Universe;
use mpi::topology::SimpleCommunicator;
use mpi::traits::*;

use super::{Envelope, MessageTag, Transport, WireType};
use crate::error::{Error, Result};

pub struct MpiTransport {
    // finalises mpi on drop, so it must outlive the communicator
    _universe: Universe,
    world: SimpleCommunicator,
    rank: usize,
    size: usize,
    // landing buffer for incoming payloads, grown on demand
    recv_buf: Vec<u8>,
}

impl MpiTransport {
    pub fn initialize() -> Result<Self> {
        let universe = mpi::initialize()
            .ok_or_else(|| Error::Transport("mpi has already been initialized".into()))?;
        let world = universe.world();
        let rank = world.rank() as usize;
        let size = world.size() as usize;
        log::info!("mpi initialized: rank {} of {}", rank, size);
        Ok(Self {
            _universe: universe,
            world,
            rank,
            size,
            recv_buf: Vec::new(),
        })
    }

    fn check_rank(&self, rank: usize) -> Result<i32> {
        if rank >= self.size {
            return Err(Error::Transport(format!(
                "process {} does not exist in a run of {} processes",
                rank, self.size
            )));
        }
        Ok(rank as i32)
    }
}

impl Transport for MpiTransport {
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
        _wire_type: WireType,
        payload: &[u8],
    ) -> Result<()> {
        let dest = self.check_rank(dest)?;
        self.world
            .process_at_rank(dest)
            .send_with_tag(payload, tag.as_u8() as i32);
        Ok(())
    }

    fn probe(&mut self, source: usize, tag: MessageTag) -> Result<Option<Envelope>> {
        let rank = self.check_rank(source)?;
        let status = self
            .world
            .process_at_rank(rank)
            .immediate_probe_with_tag(tag.as_u8() as i32);

        Ok(status.map(|status| Envelope {
            source,
            tag,
            wire_type: tag.wire_type(),
            len_bytes: status.count(u8::equivalent_datatype()) as usize,
        }))
    }

    fn receive(
        &mut self,
        source: usize,
        tag: MessageTag,
        on_payload: &mut dyn FnMut(&[u8]) -> Result<()>,
    ) -> Result<()> {
        let rank = self.check_rank(source)?;
        let process = self.world.process_at_rank(rank);
        let status = process.probe_with_tag(tag.as_u8() as i32);
        let len = status.count(u8::equivalent_datatype()) as usize;

        if self.recv_buf.len() < len {
            self.recv_buf
                .try_reserve_exact(len - self.recv_buf.len())
                .map_err(|_| Error::OutOfMemory { bytes: len })?;
            self.recv_buf.resize(len, 0);
        }
        let buf = &mut self.recv_buf[..len];
        process.receive_into_with_tag(buf, tag.as_u8() as i32);
        on_payload(buf)
    }
}
