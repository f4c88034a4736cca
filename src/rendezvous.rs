//! Join handshake between a new agent process and the controller
//!
//! One request/response per TCP connection on the loopback interface:
//!
//! ```text
//! agent -> controller   "<species> [ticket]\n"
//! controller -> agent   "<shm-name> <mutex-name> <slot-id-or-empty>"
//! ```
//!
//! An empty slot id means the population table is full. Admission is
//! serialised: each connection is answered before the next is accepted.

use crate::config::{HANDSHAKE_TIMEOUT, MAX_REQUEST_BYTES};
use crate::core::layout::SlotId;
use crate::core::shared_table::ResourceNames;
use crate::species::{Species, UnknownSpecies};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("empty join request")]
    EmptyRequest,
    #[error(transparent)]
    Species(#[from] UnknownSpecies),
    #[error("invalid admission ticket {0:?}")]
    InvalidTicket(String),
    #[error("unexpected trailing token {0:?}")]
    TrailingToken(String),
    #[error("malformed join reply {0:?}")]
    MalformedReply(String),
}

#[derive(Debug, Error)]
pub enum JoinError {
    #[error("connection refused by {0}")]
    Refused(SocketAddr),
    #[error("handshake timed out")]
    Timeout,
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinRequest {
    pub species: Species,
    /// Slot reserved by the controller when it spawned this agent.
    pub ticket: Option<SlotId>,
}

impl JoinRequest {
    pub fn bare(species: Species) -> Self {
        Self {
            species,
            ticket: None,
        }
    }

    pub fn with_ticket(species: Species, ticket: SlotId) -> Self {
        Self {
            species,
            ticket: Some(ticket),
        }
    }

    pub fn encode(&self) -> String {
        match self.ticket {
            Some(ticket) => format!("{} {}", self.species.token(), ticket),
            None => self.species.token().to_string(),
        }
    }

    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let mut tokens = line.split_whitespace();
        let species = tokens
            .next()
            .ok_or(ProtocolError::EmptyRequest)?
            .parse::<Species>()?;
        let ticket = match tokens.next() {
            Some(raw) => Some(SlotId(
                raw.parse()
                    .map_err(|_| ProtocolError::InvalidTicket(raw.to_string()))?,
            )),
            None => None,
        };
        if let Some(extra) = tokens.next() {
            return Err(ProtocolError::TrailingToken(extra.to_string()));
        }
        Ok(Self { species, ticket })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinReply {
    pub names: ResourceNames,
    /// `None` when no slot is available.
    pub slot: Option<SlotId>,
}

impl JoinReply {
    pub fn encode(&self) -> String {
        let slot = self.slot.map(|slot| slot.to_string()).unwrap_or_default();
        format!("{} {} {}", self.names.shm, self.names.mutex, slot)
    }

    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let malformed = || ProtocolError::MalformedReply(raw.to_string());
        let line = raw.trim_end_matches(['\r', '\n']);
        let mut parts = line.splitn(3, ' ');
        let shm = parts.next().filter(|part| !part.is_empty()).ok_or_else(malformed)?;
        let mutex = parts.next().filter(|part| !part.is_empty()).ok_or_else(malformed)?;
        let slot = match parts.next().map(str::trim) {
            None | Some("") => None,
            Some(id) => Some(SlotId(id.parse().map_err(|_| malformed())?)),
        };
        Ok(Self {
            names: ResourceNames::new(shm, mutex),
            slot,
        })
    }
}

/// Decides which slot, if any, a join request receives.
pub trait Admission: Send + Sync {
    fn admit(&self, request: &JoinRequest) -> Option<SlotId>;
}

/// What happened to one accepted connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionOutcome {
    Admitted(Species, SlotId),
    Exhausted(Species),
    ForeignPeer(IpAddr),
    Rejected(ProtocolError),
    Failed(String),
}

pub struct RendezvousListener {
    listener: TcpListener,
    expected_peer: IpAddr,
}

impl RendezvousListener {
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        Ok(Self {
            listener,
            expected_peer: addr.ip(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept and answer connections until `stop` is raised. A raised flag is
    /// noticed on the next accepted connection.
    pub fn serve<A: Admission + ?Sized>(
        &self,
        admission: &A,
        names: &ResourceNames,
        stop: &AtomicBool,
    ) {
        loop {
            let accepted = self.listener.accept();
            if stop.load(Ordering::SeqCst) {
                break;
            }
            match accepted {
                Ok((stream, peer)) => {
                    let outcome =
                        handle_connection(stream, peer, self.expected_peer, admission, names);
                    log_outcome(peer, &outcome);
                }
                Err(err) => warn!(error = %err, "rendezvous accept failed"),
            }
        }
        debug!("rendezvous listener stopped");
    }

    pub fn spawn<A: Admission + 'static>(
        self,
        admission: Arc<A>,
        names: ResourceNames,
    ) -> io::Result<RendezvousHandle> {
        let addr = self.local_addr()?;
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name("rendezvous".to_string())
            .spawn(move || self.serve(admission.as_ref(), &names, &thread_stop))?;
        Ok(RendezvousHandle {
            stop,
            addr,
            thread: Some(thread),
        })
    }
}

fn log_outcome(peer: SocketAddr, outcome: &ConnectionOutcome) {
    match outcome {
        ConnectionOutcome::Admitted(species, slot) => {
            info!(%peer, %species, slot = slot.index(), "agent admitted")
        }
        ConnectionOutcome::Exhausted(species) => {
            info!(%peer, %species, "join refused: population table full")
        }
        ConnectionOutcome::ForeignPeer(ip) => warn!(%ip, "join refused: unexpected peer address"),
        ConnectionOutcome::Rejected(err) => warn!(%peer, error = %err, "join request rejected"),
        ConnectionOutcome::Failed(err) => warn!(%peer, error = %err, "join connection failed"),
    }
}

/// Answer one connection and close it.
pub fn handle_connection<A: Admission + ?Sized>(
    stream: TcpStream,
    peer: SocketAddr,
    expected_peer: IpAddr,
    admission: &A,
    names: &ResourceNames,
) -> ConnectionOutcome {
    let outcome = answer(&stream, peer, expected_peer, admission, names);
    let _ = stream.shutdown(Shutdown::Both);
    outcome
}

fn answer<A: Admission + ?Sized>(
    mut stream: &TcpStream,
    peer: SocketAddr,
    expected_peer: IpAddr,
    admission: &A,
    names: &ResourceNames,
) -> ConnectionOutcome {
    if peer.ip() != expected_peer {
        return ConnectionOutcome::ForeignPeer(peer.ip());
    }
    if let Err(err) = stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT)) {
        return ConnectionOutcome::Failed(err.to_string());
    }

    let mut line = String::new();
    if let Err(err) = BufReader::new(stream.take(MAX_REQUEST_BYTES)).read_line(&mut line) {
        return ConnectionOutcome::Failed(err.to_string());
    }
    let request = match JoinRequest::parse(&line) {
        Ok(request) => request,
        Err(err) => return ConnectionOutcome::Rejected(err),
    };

    let slot = admission.admit(&request);
    let reply = JoinReply {
        names: names.clone(),
        slot,
    };
    if let Err(err) = stream.write_all(reply.encode().as_bytes()) {
        return ConnectionOutcome::Failed(err.to_string());
    }
    match slot {
        Some(slot) => ConnectionOutcome::Admitted(request.species, slot),
        None => ConnectionOutcome::Exhausted(request.species),
    }
}

/// Running accept loop; `shutdown` stops and joins it.
pub struct RendezvousHandle {
    stop: Arc<AtomicBool>,
    addr: SocketAddr,
    thread: Option<JoinHandle<()>>,
}

impl RendezvousHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.stop.store(true, Ordering::SeqCst);
        // wake the blocking accept
        let _ = TcpStream::connect_timeout(&self.addr, Duration::from_secs(1));
        if thread.join().is_err() {
            warn!("rendezvous thread panicked");
        }
    }
}

impl Drop for RendezvousHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Agent side of the handshake. Every failure is returned, never raised.
pub fn join(
    addr: SocketAddr,
    request: &JoinRequest,
    timeout: Duration,
) -> Result<JoinReply, JoinError> {
    let classify = |err: io::Error| match err.kind() {
        io::ErrorKind::ConnectionRefused => JoinError::Refused(addr),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => JoinError::Timeout,
        _ => JoinError::Io(err),
    };

    let mut stream = TcpStream::connect_timeout(&addr, timeout).map_err(classify)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    stream
        .write_all(format!("{}\n", request.encode()).as_bytes())
        .map_err(classify)?;
    let _ = stream.shutdown(Shutdown::Write);

    let mut raw = String::new();
    stream
        .take(MAX_REQUEST_BYTES)
        .read_to_string(&mut raw)
        .map_err(classify)?;
    Ok(JoinReply::parse(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::SlotAllocator;
    use parking_lot::Mutex;
    use std::net::Ipv4Addr;

    struct FreshSlots(Mutex<SlotAllocator>);

    impl Admission for FreshSlots {
        fn admit(&self, _request: &JoinRequest) -> Option<SlotId> {
            self.0.lock().acquire()
        }
    }

    fn names() -> ResourceNames {
        ResourceNames::new("/col_shm", "/col_sem")
    }

    fn start(capacity: usize) -> RendezvousHandle {
        let listener =
            RendezvousListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).unwrap();
        listener
            .spawn(Arc::new(FreshSlots(Mutex::new(SlotAllocator::new(capacity)))), names())
            .unwrap()
    }

    #[test]
    fn test_request_parsing() {
        assert_eq!(JoinRequest::parse("prey\n").unwrap(), JoinRequest::bare(Species::Prey));
        assert_eq!(
            JoinRequest::parse("predator 3").unwrap(),
            JoinRequest::with_ticket(Species::Predator, SlotId(3))
        );
        assert_eq!(JoinRequest::parse("  \n"), Err(ProtocolError::EmptyRequest));
        assert!(matches!(JoinRequest::parse("wolf"), Err(ProtocolError::Species(_))));
        assert_eq!(
            JoinRequest::parse("prey x"),
            Err(ProtocolError::InvalidTicket("x".to_string()))
        );
        assert_eq!(
            JoinRequest::parse("prey 1 2"),
            Err(ProtocolError::TrailingToken("2".to_string()))
        );
    }

    #[test]
    fn test_reply_with_and_without_slot() {
        let full = JoinReply {
            names: names(),
            slot: Some(SlotId(7)),
        };
        assert_eq!(full.encode(), "/col_shm /col_sem 7");
        assert_eq!(JoinReply::parse("/col_shm /col_sem 7").unwrap(), full);

        let exhausted = JoinReply {
            names: names(),
            slot: None,
        };
        assert_eq!(exhausted.encode(), "/col_shm /col_sem ");
        assert_eq!(JoinReply::parse("/col_shm /col_sem ").unwrap(), exhausted);
        assert!(JoinReply::parse("").is_err());
        assert!(JoinReply::parse("/col_shm /col_sem abc").is_err());
    }

    #[test]
    fn test_live_handshake_until_exhausted() {
        let mut handle = start(2);
        let addr = handle.local_addr();
        let request = JoinRequest::bare(Species::Prey);

        let first = join(addr, &request, HANDSHAKE_TIMEOUT).unwrap();
        let second = join(addr, &request, HANDSHAKE_TIMEOUT).unwrap();
        let third = join(addr, &request, HANDSHAKE_TIMEOUT).unwrap();
        assert_eq!(first.slot, Some(SlotId(0)));
        assert_eq!(second.slot, Some(SlotId(1)));
        assert_eq!(third.slot, None);
        assert_eq!(third.names, names());

        handle.shutdown();
    }

    #[test]
    fn test_unknown_species_gets_no_reply() {
        let handle = start(1);
        let mut stream = TcpStream::connect(handle.local_addr()).unwrap();
        stream.write_all(b"wolf\n").unwrap();
        let mut reply = String::new();
        stream.read_to_string(&mut reply).unwrap();
        assert!(reply.is_empty());
    }

    #[test]
    fn test_join_without_listener_is_refused() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let result = join(addr, &JoinRequest::bare(Species::Prey), Duration::from_secs(1));
        assert!(matches!(result, Err(JoinError::Refused(_))));
    }

    #[test]
    fn test_foreign_peer_is_refused() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let addr = listener.local_addr().unwrap();
        let client = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            let _ = stream.write_all(b"prey\n");
            let mut reply = String::new();
            let _ = stream.read_to_string(&mut reply);
            reply
        });
        let (stream, peer) = listener.accept().unwrap();
        let admission = FreshSlots(Mutex::new(SlotAllocator::new(1)));
        // pretend only 10.0.0.1 may join
        let outcome = handle_connection(
            stream,
            peer,
            IpAddr::from([10, 0, 0, 1]),
            &admission,
            &names(),
        );
        assert_eq!(outcome, ConnectionOutcome::ForeignPeer(peer.ip()));
        assert!(client.join().unwrap().is_empty());
        assert_eq!(admission.0.lock().outstanding(), 0);
    }
}
