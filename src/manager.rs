//! typed messaging between the supervisor and its workers.
//!
//! [`MpiManager`] owns a [`Transport`] plus the scratch buffers incoming
//! payloads are decoded into. it is created once at program start and handed
//! by reference to the aggregation code; it is not thread safe and expects
//! one call at a time.
//!
//! `receive_from_others` visits peers one by one in ascending rank order
//! rather than overlapping receives. only one incoming payload is held at a
//! time and it is decoded straight from the transport's buffer into the typed
//! scratch, which keeps peak memory flat for large qubit counts at the cost of
//! latency.

use std::thread;
use std::time::{Duration, Instant};

use crate::config::DistributedConfig;
use crate::error::{Error, Result};
use crate::transport::{Envelope, MessageTag, Transport, WireElement, WireScratch};

/// rank of the coordinating process.
pub const SUPERVISOR_RANK: usize = 0;

pub struct MpiManager<T: Transport> {
    transport: T,
    process_id: usize,
    total_processes: usize,
    receive_timeout: Duration,
    poll_interval: Duration,
    typed_scratch: WireScratch,
}

impl<T: Transport> MpiManager<T> {
    pub fn new(transport: T, receive_timeout: Duration) -> Self {
        let process_id = transport.rank();
        let total_processes = transport.size();
        log::debug!(
            "mpi manager ready: process {} of {}, receive timeout {:?}",
            process_id,
            total_processes,
            receive_timeout
        );
        Self {
            transport,
            process_id,
            total_processes,
            receive_timeout,
            poll_interval: Duration::from_millis(1),
            typed_scratch: WireScratch::default(),
        }
    }

    pub fn from_config(transport: T, config: &DistributedConfig) -> Self {
        Self::new(transport, config.receive_timeout()).with_poll_interval(config.poll_interval())
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn get_process_id(&self) -> usize {
        self.process_id
    }

    pub fn get_total_processes(&self) -> usize {
        self.total_processes
    }

    pub fn is_supervisor(&self) -> bool {
        self.process_id == SUPERVISOR_RANK
    }

    pub fn receive_timeout(&self) -> Duration {
        self.receive_timeout
    }

    fn check_wire_type<E: WireElement>(tag: MessageTag) -> Result<()> {
        let expected = tag.wire_type();
        if expected != E::WIRE_TYPE {
            return Err(Error::WireTypeMismatch {
                tag,
                expected,
                actual: E::WIRE_TYPE,
            });
        }
        Ok(())
    }

    /// blocking send of `data` to the supervisor.
    pub fn send_to_supervisor<E: WireElement>(&mut self, data: &[E], tag: MessageTag) -> Result<()> {
        Self::check_wire_type::<E>(tag)?;

        let mut payload = Vec::new();
        E::write_le(data, &mut payload);
        log::trace!(
            "process {} sending {} message ({} elements) to supervisor",
            self.process_id,
            tag,
            data.len()
        );
        self.transport
            .send(SUPERVISOR_RANK, tag, E::WIRE_TYPE, &payload)
    }

    // polls until a `tag` message from `source` is ready or the timeout expires.
    fn wait_for(&mut self, source: usize, tag: MessageTag) -> Result<Envelope> {
        let start_time = Instant::now();
        loop {
            if let Some(envelope) = self.transport.probe(source, tag)? {
                return Ok(envelope);
            }
            let waited = start_time.elapsed();
            if waited >= self.receive_timeout {
                log::warn!(
                    "process {} gave up waiting for {} message from process {} after {:?}",
                    self.process_id,
                    tag,
                    source,
                    waited
                );
                return Err(Error::Timeout {
                    process_id: source,
                    tag,
                    waited,
                });
            }
            thread::sleep(self.poll_interval);
        }
    }

    /// receives one `tag` message from every other process, in ascending
    /// rank order, and hands each payload to `on_message`.
    ///
    /// the slice passed to the callback is only valid for that call; the
    /// next receive reuses the same buffer.
    pub fn receive_from_others<E, F>(&mut self, tag: MessageTag, mut on_message: F) -> Result<()>
    where
        E: WireElement,
        F: FnMut(usize, &[E]) -> Result<()>,
    {
        Self::check_wire_type::<E>(tag)?;

        for source in 0..self.total_processes {
            if source == self.process_id {
                continue;
            }

            let envelope = self.wait_for(source, tag)?;
            if envelope.wire_type != E::WIRE_TYPE {
                return Err(Error::WireTypeMismatch {
                    tag,
                    expected: E::WIRE_TYPE,
                    actual: envelope.wire_type,
                });
            }
            let count = envelope.element_count()?;

            let typed = E::scratch(&mut self.typed_scratch);
            grow_scratch(typed, count, envelope.wire_type.size_of())?;
            let elements = &mut typed[..count];
            self.transport.receive(source, tag, &mut |bytes| {
                if bytes.len() != envelope.len_bytes {
                    return Err(Error::Transport(format!(
                        "{} message from process {} was probed at {} bytes but delivered {}",
                        tag,
                        source,
                        envelope.len_bytes,
                        bytes.len()
                    )));
                }
                E::read_le(bytes, elements);
                Ok(())
            })?;

            log::trace!(
                "process {} received {} message ({} elements) from process {}",
                self.process_id,
                tag,
                count,
                source
            );
            on_message(source, elements)?;
        }

        Ok(())
    }
}

// makes sure `buf` holds at least `len` elements, growing it only when needed.
fn grow_scratch<E: Copy + Default>(buf: &mut Vec<E>, len: usize, elem_size: usize) -> Result<()> {
    if buf.len() >= len {
        return Ok(());
    }
    let additional = len - buf.len();
    buf.try_reserve_exact(additional).map_err(|_| Error::OutOfMemory {
        bytes: len.saturating_mul(elem_size),
    })?;
    buf.resize(len, E::default());
    Ok(())
}
