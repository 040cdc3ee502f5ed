// rust-xmpp
// Copyright (c) 2014-2015 Florian Zeitz
//
// This project is MIT licensed.
// Please see the COPYING file for more information.

use std::io;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use openssl::ssl::{SslConnector, SslMethod, SslStream};
use tracing::debug;

/// A connected byte stream to the server.
pub trait Transport: Send {
    /// Wait at most `timeout` for data.
    ///
    /// Returns `Ok(None)` when nothing arrived in time and `Ok(Some(0))`
    /// when the peer closed the stream.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>>;

    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    fn close(&mut self) -> io::Result<()>;

    /// Negotiate TLS over the existing stream, after `<proceed/>`.
    fn starttls(&mut self, domain: &str) -> io::Result<()> {
        let _ = domain;
        Err(io::Error::new(io::ErrorKind::Unsupported, "transport cannot negotiate TLS"))
    }

    fn is_secure(&self) -> bool {
        false
    }
}

/// Opens transports. `Connection` owns one and calls it from `open`.
pub trait Connector: Send {
    fn connect(&mut self, host: &str, port: u16) -> io::Result<Box<dyn Transport>>;
}

/// Plain TCP, or TLS from the first byte when `use_tls` is set.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector {
    pub use_tls: bool,
}

impl TcpConnector {
    pub fn new(use_tls: bool) -> TcpConnector {
        TcpConnector { use_tls }
    }
}

impl Connector for TcpConnector {
    fn connect(&mut self, host: &str, port: u16) -> io::Result<Box<dyn Transport>> {
        debug!(host, port, tls = self.use_tls, "connecting");
        let stream = TcpStream::connect((host, port))?;
        stream.set_nodelay(true)?;

        if !self.use_tls {
            return Ok(Box::new(XmppSocket::Tcp(stream)));
        }
        Ok(Box::new(XmppSocket::Tls(tls_handshake(host, stream)?)))
    }
}

/// Longest the TLS handshake may wait on the server.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

fn tls_handshake(domain: &str, stream: TcpStream) -> io::Result<SslStream<TcpStream>> {
    stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
    let connector = SslConnector::builder(SslMethod::tls())
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
        .build();
    connector
        .connect(domain, stream)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("TLS handshake failed: {}", e)))
}

pub enum XmppSocket {
    Tcp(TcpStream),
    Tls(SslStream<TcpStream>),
}

impl XmppSocket {
    fn tcp(&self) -> &TcpStream {
        match *self {
            XmppSocket::Tcp(ref stream) => stream,
            XmppSocket::Tls(ref stream) => stream.get_ref(),
        }
    }
}

fn no_data(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted)
}

impl Transport for XmppSocket {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        // A zero read timeout means "block forever" to the OS.
        self.tcp().set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        let result = match *self {
            XmppSocket::Tcp(ref mut stream) => stream.read(buf),
            XmppSocket::Tls(ref mut stream) => stream.read(buf),
        };
        match result {
            Ok(n) => Ok(Some(n)),
            Err(ref e) if no_data(e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match *self {
            XmppSocket::Tcp(ref mut stream) => {
                stream.write_all(data)?;
                stream.flush()
            }
            XmppSocket::Tls(ref mut stream) => {
                stream.write_all(data)?;
                stream.flush()
            }
        }
    }

    fn close(&mut self) -> io::Result<()> {
        if let XmppSocket::Tls(ref mut stream) = *self {
            // The peer may already be gone; the TCP shutdown below still matters.
            let _ = stream.shutdown();
        }
        match self.tcp().shutdown(Shutdown::Both) {
            Err(ref e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }

    fn starttls(&mut self, domain: &str) -> io::Result<()> {
        let tcp = match *self {
            XmppSocket::Tcp(ref stream) => stream.try_clone()?,
            XmppSocket::Tls(_) => {
                return Err(io::Error::new(io::ErrorKind::Other, "TLS already negotiated"));
            }
        };
        debug!(domain, "starting TLS");
        *self = XmppSocket::Tls(tls_handshake(domain, tcp)?);
        Ok(())
    }

    fn is_secure(&self) -> bool {
        matches!(*self, XmppSocket::Tls(_))
    }
}
