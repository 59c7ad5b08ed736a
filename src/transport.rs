//! The transport seam: a framed, text-message, bidirectional byte stream
//! with per-operation deadlines and a negotiated subprotocol.
//!
//! The gateway only ever sees this trait. Two realizations ship here: an
//! in-process [`pipe`] used by tests and same-process embeddings, and a
//! TCP transport carrying one JSON message per line, negotiating the
//! subprotocol as the first line in each direction. A websocket upgrade
//! layer would implement the same trait.

use std::io::{BufRead, BufReader, Write};
use std::net::Shutdown;
use std::time::Duration;

use bytes::Bytes;
use may::net::TcpStream;
use may::sync::{mpsc, Mutex};

use crate::errors::Error;

/// The negotiated subprotocol tag.
pub const SUBPROTOCOL: &str = "juggler.0";

/// A framed text-message transport.
///
/// `receive` and `send` block with the given deadline (`None` blocks
/// forever). Read errors, including deadline overruns, are fatal to the
/// connection using the transport. Closing is the responsibility of the
/// layer that accepted the connection, never of the connection itself.
pub trait Transport: Send + Sync + 'static {
    /// Blocks for the next text frame.
    fn receive(&self, timeout: Option<Duration>) -> Result<Bytes, Error>;

    /// Writes one whole frame.
    fn send(&self, frame: &[u8], timeout: Option<Duration>) -> Result<(), Error>;

    /// The subprotocol agreed on at accept time.
    fn subprotocol(&self) -> &str;

    /// Tears the transport down, unblocking the peer.
    fn close(&self);
}

/// Creates a connected in-process transport pair.
pub fn pipe() -> (PipeTransport, PipeTransport) {
    let (atx, arx) = mpsc::channel();
    let (btx, brx) = mpsc::channel();
    (
        PipeTransport {
            tx: Mutex::new(Some(atx)),
            rx: Mutex::new(brx),
        },
        PipeTransport {
            tx: Mutex::new(Some(btx)),
            rx: Mutex::new(arx),
        },
    )
}

/// One end of an in-process transport pair.
pub struct PipeTransport {
    tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    rx: Mutex<mpsc::Receiver<Bytes>>,
}

impl Transport for PipeTransport {
    fn receive(&self, timeout: Option<Duration>) -> Result<Bytes, Error> {
        let rx = self.rx.lock().unwrap();
        match timeout {
            None => rx.recv().map_err(|_| Error::Closed),
            Some(t) => rx.recv_timeout(t).map_err(|_| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "read deadline exceeded",
                ))
            }),
        }
    }

    fn send(&self, frame: &[u8], _timeout: Option<Duration>) -> Result<(), Error> {
        let tx = self.tx.lock().unwrap();
        tx.as_ref()
            .ok_or(Error::Closed)?
            .send(Bytes::copy_from_slice(frame))
            .map_err(|_| Error::Closed)
    }

    fn subprotocol(&self) -> &str {
        SUBPROTOCOL
    }

    fn close(&self) {
        self.tx.lock().unwrap().take();
    }
}

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// TCP transport, one JSON message per line. The first line each way
/// negotiates the subprotocol: the client offers a comma-separated list,
/// the server answers with its pick.
pub struct TcpTransport {
    reader: Mutex<BufReader<TcpStream>>,
    writer: Mutex<TcpStream>,
    subprotocol: String,
}

impl TcpTransport {
    /// Server side of the handshake.
    pub fn accept(stream: TcpStream) -> Result<Self, Error> {
        let mut reader = BufReader::new(stream.try_clone()?);
        reader.get_mut().set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
        let mut line = String::new();
        reader.read_line(&mut line)?;
        let chosen = line
            .split(',')
            .map(str::trim)
            .find(|p| *p == SUBPROTOCOL)
            .ok_or_else(|| Error::Handshake(format!("no supported subprotocol in {line:?}")))?
            .to_owned();
        reader.get_mut().set_read_timeout(None)?;

        let mut writer = stream;
        writer.write_all(format!("{chosen}\n").as_bytes())?;
        Ok(TcpTransport {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            subprotocol: chosen,
        })
    }

    /// Client side of the handshake.
    pub fn connect(stream: TcpStream) -> Result<Self, Error> {
        let mut reader = BufReader::new(stream.try_clone()?);
        let mut writer = stream;
        writer.write_all(format!("{SUBPROTOCOL}\n").as_bytes())?;

        reader.get_mut().set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
        let mut line = String::new();
        reader.read_line(&mut line)?;
        if line.trim() != SUBPROTOCOL {
            return Err(Error::Handshake(format!(
                "server answered subprotocol {line:?}"
            )));
        }
        reader.get_mut().set_read_timeout(None)?;
        Ok(TcpTransport {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            subprotocol: SUBPROTOCOL.to_owned(),
        })
    }
}

impl Transport for TcpTransport {
    fn receive(&self, timeout: Option<Duration>) -> Result<Bytes, Error> {
        let mut reader = self.reader.lock().unwrap();
        reader.get_mut().set_read_timeout(timeout)?;
        let mut line = String::new();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            return Err(Error::Closed);
        }
        if line.ends_with('\n') {
            line.pop();
        }
        Ok(Bytes::from(line.into_bytes()))
    }

    fn send(&self, frame: &[u8], timeout: Option<Duration>) -> Result<(), Error> {
        let mut writer = self.writer.lock().unwrap();
        writer.set_write_timeout(timeout)?;
        writer.write_all(frame)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        writer.set_write_timeout(None)?;
        Ok(())
    }

    fn subprotocol(&self) -> &str {
        &self.subprotocol
    }

    fn close(&self) {
        if let Ok(writer) = self.writer.lock() {
            let _ = writer.shutdown(Shutdown::Both);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_carries_frames_both_ways() {
        let (a, b) = pipe();
        a.send(b"ping", None).unwrap();
        assert_eq!(b.receive(None).unwrap().as_ref(), b"ping");
        b.send(b"pong", None).unwrap();
        assert_eq!(a.receive(None).unwrap().as_ref(), b"pong");
    }

    #[test]
    fn pipe_close_unblocks_the_peer() {
        let (a, b) = pipe();
        a.close();
        assert!(matches!(b.receive(None), Err(Error::Closed)));
        assert!(matches!(a.send(b"x", None), Err(Error::Closed)));
    }

    #[test]
    fn pipe_receive_honors_the_deadline() {
        let (a, _b) = pipe();
        let start = std::time::Instant::now();
        assert!(a.receive(Some(Duration::from_millis(30))).is_err());
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn tcp_handshake_and_frames() {
        use may::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = may::go!(move || {
            let (stream, _) = listener.accept().unwrap();
            let t = TcpTransport::accept(stream).unwrap();
            assert_eq!(t.subprotocol(), SUBPROTOCOL);
            let frame = t.receive(None).unwrap();
            t.send(&frame, None).unwrap();
        });

        let stream = TcpStream::connect(addr).unwrap();
        let t = TcpTransport::connect(stream).unwrap();
        t.send(br#"{"type":"AUTH"}"#, None).unwrap();
        assert_eq!(t.receive(None).unwrap().as_ref(), br#"{"type":"AUTH"}"#);
        server.join().unwrap();
    }
}
