//! One interface over a plain TCP socket or a TLS session.
//!
//! All I/O here is non-blocking: the event loop waits for readiness on the
//! underlying [`TcpStream`] and then calls [`Transport::read`] /
//! [`Transport::write`], which report `WouldBlock` when there is nothing to
//! do. The handshake is the only async step and runs on the connect worker.

use std::io::{self, Read, Write};

use rustls::ClientConnection;
use tokio::io::Interest;
use tokio::net::TcpStream;

use crate::error::IoError;
use crate::tls::handshake_error;

/// Plaintext or TLS link to a server.
#[derive(Debug)]
pub enum Transport {
    Plain(TcpStream),
    Tls(TlsLink),
}

/// A TCP stream paired with its rustls client session.
#[derive(Debug)]
pub struct TlsLink {
    stream: TcpStream,
    session: Box<ClientConnection>,
}

/// Adapts a tokio [`TcpStream`] to `std::io` for rustls' `read_tls` and
/// `write_tls`. Never blocks; an empty socket yields `WouldBlock`.
struct SyncIo<'a>(&'a TcpStream);

impl Read for SyncIo<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.try_read(buf)
    }
}

impl Write for SyncIo<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.try_write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn would_block(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
}

impl Transport {
    pub(crate) fn tls(stream: TcpStream, session: ClientConnection) -> Self {
        Self::Tls(TlsLink {
            stream,
            session: Box::new(session),
        })
    }

    /// The socket the event loop waits on.
    pub fn stream(&self) -> &TcpStream {
        match self {
            Self::Plain(stream) => stream,
            Self::Tls(link) => &link.stream,
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }

    pub fn is_handshaking(&self) -> bool {
        match self {
            Self::Plain(_) => false,
            Self::Tls(link) => link.session.is_handshaking(),
        }
    }

    /// True when encrypted output is waiting to reach the socket.
    pub fn wants_write(&self) -> bool {
        match self {
            Self::Plain(_) => false,
            Self::Tls(link) => link.session.wants_write(),
        }
    }

    /// Readiness the loop should wait for. Readable is always included so
    /// a hangup is noticed; writable only when `queued` plaintext or TLS
    /// records are pending.
    pub fn interest(&self, queued: bool) -> Interest {
        if queued || self.wants_write() {
            Interest::READABLE.add(Interest::WRITABLE)
        } else {
            Interest::READABLE
        }
    }

    /// Read decrypted bytes. `Ok(0)` means the peer closed the link.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(stream) => stream.try_read(buf),
            Self::Tls(link) => loop {
                match link.session.reader().read(buf) {
                    Ok(n) => return Ok(n),
                    Err(e) if would_block(&e) => {}
                    Err(e) => return Err(e),
                }

                if link.session.read_tls(&mut SyncIo(&link.stream))? == 0 {
                    return Ok(0);
                }
                if let Err(e) = link.session.process_new_packets() {
                    // Best effort: let the server see our alert.
                    let _ = link.session.write_tls(&mut SyncIo(&link.stream));
                    return Err(io::Error::new(io::ErrorKind::InvalidData, e));
                }
            },
        }
    }

    /// Write plaintext. Returns how many bytes were accepted, or
    /// `WouldBlock` when neither the socket nor the session has room.
    pub fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(stream) => stream.try_write(data),
            Self::Tls(link) => {
                link.flush()?;
                let n = link.session.writer().write(data)?;
                if n == 0 && !data.is_empty() {
                    return Err(io::ErrorKind::WouldBlock.into());
                }
                link.flush()?;
                Ok(n)
            }
        }
    }

    /// Push any pending TLS records to the socket.
    pub fn flush_pending(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(_) => Ok(()),
            Self::Tls(link) => link.flush(),
        }
    }

    /// Drive the TLS handshake to completion. Plain links return at once.
    pub(crate) async fn handshake(&mut self) -> Result<(), IoError> {
        let Self::Tls(link) = self else {
            return Ok(());
        };

        while link.session.is_handshaking() || link.session.wants_write() {
            if link.session.wants_write() {
                link.stream.writable().await.map_err(handshake_io)?;
                match link.session.write_tls(&mut SyncIo(&link.stream)) {
                    Ok(_) => {}
                    Err(e) if would_block(&e) => {}
                    Err(e) => return Err(handshake_io(e)),
                }
                continue;
            }

            link.stream.readable().await.map_err(handshake_io)?;
            match link.session.read_tls(&mut SyncIo(&link.stream)) {
                Ok(0) => {
                    return Err(IoError::TlsHandshake(
                        "connection closed during handshake".into(),
                    ));
                }
                Ok(_) => {
                    if let Err(e) = link.session.process_new_packets() {
                        let _ = link.session.write_tls(&mut SyncIo(&link.stream));
                        return Err(handshake_error(e));
                    }
                }
                Err(e) if would_block(&e) => {}
                Err(e) => return Err(handshake_io(e)),
            }
        }

        Ok(())
    }

    /// Negotiated protocol and cipher suite, for diagnostics. `None` for
    /// plain links and while the handshake is still running.
    pub fn describe(&self) -> Option<String> {
        if self.is_handshaking() {
            return None;
        }
        let Self::Tls(link) = self else {
            return None;
        };
        let version = link.session.protocol_version()?;
        let suite = link.session.negotiated_cipher_suite()?;
        Some(format!("{version:?}, {:?}", suite.suite()))
    }

    /// Close the link. TLS sends close_notify on a best-effort basis.
    pub fn close(self) {
        if let Self::Tls(mut link) = self {
            link.session.send_close_notify();
            let _ = link.flush();
        }
    }
}

impl TlsLink {
    fn flush(&mut self) -> io::Result<()> {
        while self.session.wants_write() {
            match self.session.write_tls(&mut SyncIo(&self.stream)) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(_) => {}
                Err(e) if would_block(&e) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

fn handshake_io(e: io::Error) -> IoError {
    IoError::TlsHandshake(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::Verify;
    use crate::tls::TlsSettings;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), server.unwrap().0)
    }

    #[tokio::test]
    async fn plain_read_write() {
        let (client, mut server) = pair().await;
        let mut transport = Transport::Plain(client);
        assert!(!transport.is_tls());
        assert_eq!(transport.interest(false), Interest::READABLE);

        let mut buf = [0u8; 64];
        assert_eq!(
            transport.read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );

        server.write_all(b"PING :x\r\n").await.unwrap();
        transport.stream().readable().await.unwrap();
        let n = transport.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"PING :x\r\n");

        assert_eq!(transport.write(b"PONG :x\r\n").unwrap(), 9);
        let mut pong = [0u8; 9];
        server.read_exact(&mut pong).await.unwrap();
        assert_eq!(&pong, b"PONG :x\r\n");

        drop(server);
        transport.stream().readable().await.unwrap();
        assert_eq!(transport.read(&mut buf).unwrap(), 0);
    }

    #[tokio::test]
    async fn tls_session_wants_write_before_handshake() {
        let (client, _server) = pair().await;
        let (session, _) = TlsSettings::default()
            .client_session("localhost", Verify::Required)
            .unwrap();
        let transport = Transport::tls(client, session);

        assert!(transport.is_tls());
        assert!(transport.is_handshaking());
        assert_eq!(
            transport.interest(false),
            Interest::READABLE.add(Interest::WRITABLE)
        );
        assert!(transport.describe().is_none());
    }

    #[tokio::test]
    async fn handshake_against_plaintext_server_fails() {
        let (client, mut server) = pair().await;
        let (session, _) = TlsSettings::default()
            .client_session("localhost", Verify::Disabled)
            .unwrap();
        let mut transport = Transport::tls(client, session);

        tokio::spawn(async move {
            let _ = server
                .write_all(b":irc.example.org NOTICE * :not tls\r\n")
                .await;
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        });

        let err = transport.handshake().await.unwrap_err();
        assert!(matches!(err, IoError::TlsHandshake(_)));
    }
}
