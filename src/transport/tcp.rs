// tcp transport in a star topology: the supervisor accepts one connection per
// worker, workers only ever talk to the supervisor.
//
// handshake (worker -> supervisor): [rank:u32 le][size:u32 le]
// frame: [tag:u8][wire_type:u8][source:u32 le][len:u64 le][payload; len]

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::{Duration, Instant};

use super::{Envelope, Frame, MessageTag, PendingFrames, Transport, WireType};
use crate::config::DistributedConfig;
use crate::error::{Error, Result};

const FRAME_HEADER_LEN: usize = 14;
const HANDSHAKE_LEN: usize = 8;

pub struct TcpTransport {
    rank: usize,
    size: usize,
    peers: HashMap<usize, TcpStream>,
    pending: PendingFrames,
    // read timeout set on every stream
    io_timeout: Duration,
}

impl TcpTransport {
    /// connects this process according to `config`: rank 0 listens, every other rank dials in.
    pub fn from_config(config: &DistributedConfig) -> Result<Self> {
        let io_timeout = Duration::from_millis(config.receive_timeout_ms);
        if config.process_id == 0 {
            let addr = format!("0.0.0.0:{}", config.port);
            let listener = TcpListener::bind(&addr)?;
            log::info!("supervisor listening on {}", addr);
            Self::supervisor(listener, config.total_processes, io_timeout)
        } else {
            let addr = format!("{}:{}", config.supervisor_address, config.port);
            Self::worker(
                &addr,
                config.process_id,
                config.total_processes,
                config.connect_retries,
                Duration::from_millis(config.connect_retry_delay_ms),
                io_timeout,
            )
        }
    }

    /// accepts `size - 1` workers on `listener`, waiting at most `timeout` for all of them.
    pub fn supervisor(listener: TcpListener, size: usize, timeout: Duration) -> Result<Self> {
        listener.set_nonblocking(true)?;

        let start_time = Instant::now();
        let mut peers = HashMap::new();

        while peers.len() + 1 < size {
            match listener.accept() {
                Ok((mut stream, addr)) => {
                    stream.set_nonblocking(false)?;
                    stream.set_read_timeout(Some(timeout))?;
                    stream.set_nodelay(true)?;

                    let mut handshake = [0u8; HANDSHAKE_LEN];
                    stream.read_exact(&mut handshake)?;
                    let rank = u32::from_le_bytes([handshake[0], handshake[1], handshake[2], handshake[3]])
                        as usize;
                    let worker_size =
                        u32::from_le_bytes([handshake[4], handshake[5], handshake[6], handshake[7]])
                            as usize;

                    if worker_size != size {
                        return Err(Error::Transport(format!(
                            "process {} at {} expects {} processes, supervisor expects {}",
                            rank, addr, worker_size, size
                        )));
                    }
                    if rank == 0 || rank >= size || peers.contains_key(&rank) {
                        return Err(Error::Transport(format!(
                            "invalid or duplicate rank {} announced by {}",
                            rank, addr
                        )));
                    }

                    log::info!("process {} connected from {}", rank, addr);
                    peers.insert(rank, stream);
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    if start_time.elapsed() > timeout {
                        return Err(Error::Transport(format!(
                            "timed out waiting for workers to connect, {}/{} connected",
                            peers.len(),
                            size - 1
                        )));
                    }
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(Self {
            rank: 0,
            size,
            peers,
            pending: PendingFrames::default(),
            io_timeout: timeout,
        })
    }

    /// dials the supervisor at `addr` and announces `rank`.
    pub fn worker(
        addr: &str,
        rank: usize,
        size: usize,
        max_retries: u32,
        retry_delay: Duration,
        io_timeout: Duration,
    ) -> Result<Self> {
        if rank == 0 || rank >= size {
            return Err(Error::Config(format!(
                "worker rank {} is outside 1..{}",
                rank, size
            )));
        }

        let mut retry_count = 0;
        let mut stream = loop {
            let attempt = addr
                .to_socket_addrs()
                .and_then(|mut addrs| {
                    addrs.next().ok_or_else(|| {
                        std::io::Error::new(ErrorKind::NotFound, "address did not resolve")
                    })
                })
                .and_then(|sock| TcpStream::connect_timeout(&sock, io_timeout));
            match attempt {
                Ok(s) => break s,
                Err(e) if retry_count + 1 < max_retries => {
                    retry_count += 1;
                    log::warn!(
                        "failed to connect to supervisor at {}: {}. retrying ({}/{})",
                        addr,
                        e,
                        retry_count,
                        max_retries
                    );
                    thread::sleep(retry_delay);
                }
                Err(e) => {
                    return Err(Error::Transport(format!(
                        "failed to connect to supervisor at {} after {} attempts: {}",
                        addr, max_retries, e
                    )))
                }
            }
        };

        stream.set_read_timeout(Some(io_timeout))?;
        stream.set_nodelay(true)?;

        let mut handshake = [0u8; HANDSHAKE_LEN];
        handshake[..4].copy_from_slice(&(rank as u32).to_le_bytes());
        handshake[4..].copy_from_slice(&(size as u32).to_le_bytes());
        stream.write_all(&handshake)?;

        let mut peers = HashMap::new();
        peers.insert(0, stream);

        Ok(Self {
            rank,
            size,
            peers,
            pending: PendingFrames::default(),
            io_timeout,
        })
    }

    fn stream(peers: &mut HashMap<usize, TcpStream>, rank: usize) -> Result<&mut TcpStream> {
        peers
            .get_mut(&rank)
            .ok_or_else(|| Error::Transport(format!("no connection to process {}", rank)))
    }
}

// true when at least one byte is waiting on the stream.
fn frame_available(stream: &mut TcpStream, source: usize) -> Result<bool> {
    stream.set_nonblocking(true)?;
    let mut probe_byte = [0u8; 1];
    let peeked = stream.peek(&mut probe_byte);
    stream.set_nonblocking(false)?;

    match peeked {
        Ok(0) => Err(Error::Transport(format!(
            "connection to process {} was closed",
            source
        ))),
        Ok(_) => Ok(true),
        Err(ref e) if e.kind() == ErrorKind::WouldBlock => Ok(false),
        Err(e) => Err(e.into()),
    }
}

// a peer that stops part way through a frame shows up as a read timeout.
fn stalled_read(err: Error, source: usize, tag: MessageTag, waited: Duration) -> Error {
    match err {
        Error::Io(ref io) if matches!(io.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
            log::warn!(
                "process {} stalled mid-frame while waiting for {} message",
                source,
                tag
            );
            Error::Timeout {
                process_id: source,
                tag,
                waited,
            }
        }
        other => other,
    }
}

fn read_frame(stream: &mut TcpStream) -> Result<Frame> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    stream.read_exact(&mut header)?;

    let tag = MessageTag::from_u8(header[0])
        .ok_or_else(|| Error::Decode(format!("unknown message tag {}", header[0])))?;
    let wire_type = WireType::from_u8(header[1])
        .ok_or_else(|| Error::Decode(format!("unknown wire type {}", header[1])))?;
    let source = u32::from_le_bytes([header[2], header[3], header[4], header[5]]) as usize;
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&header[6..14]);
    let len = usize::try_from(u64::from_le_bytes(len_bytes))
        .map_err(|_| Error::Decode("frame length does not fit in memory".into()))?;

    let mut payload = Vec::new();
    payload
        .try_reserve_exact(len)
        .map_err(|_| Error::OutOfMemory { bytes: len })?;
    payload.resize(len, 0);
    stream.read_exact(&mut payload)?;

    Ok(Frame {
        source,
        tag,
        wire_type,
        payload,
    })
}

impl Transport for TcpTransport {
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
        let rank = self.rank;
        let stream = Self::stream(&mut self.peers, dest)?;

        let mut header = [0u8; FRAME_HEADER_LEN];
        header[0] = tag.as_u8();
        header[1] = wire_type as u8;
        header[2..6].copy_from_slice(&(rank as u32).to_le_bytes());
        header[6..14].copy_from_slice(&(payload.len() as u64).to_le_bytes());

        stream.write_all(&header)?;
        stream.write_all(payload)?;
        stream.flush()?;
        Ok(())
    }

    fn probe(&mut self, source: usize, tag: MessageTag) -> Result<Option<Envelope>> {
        if let Some(env) = self.pending.peek(source, tag) {
            return Ok(Some(env));
        }

        let io_timeout = self.io_timeout;
        let stream = Self::stream(&mut self.peers, source)?;
        loop {
            if !frame_available(stream, source)? {
                return Ok(None);
            }
            let frame =
                read_frame(stream).map_err(|e| stalled_read(e, source, tag, io_timeout))?;
            if frame.source != source {
                return Err(Error::Transport(format!(
                    "connection of process {} carried a frame from process {}",
                    source, frame.source
                )));
            }
            let matched = frame.tag == tag;
            self.pending.push(frame);
            if matched {
                return Ok(self.pending.peek(source, tag));
            }
        }
    }

    fn receive(
        &mut self,
        source: usize,
        tag: MessageTag,
        on_payload: &mut dyn FnMut(&[u8]) -> Result<()>,
    ) -> Result<()> {
        self.pending.take_with(source, tag, on_payload)
    }
}
