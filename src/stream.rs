//! Byte-stream transport abstraction.
//!
//! The connection runs on any [`Stream`]: a full-duplex, blocking byte stream
//! whose methods take `&self` so the read half and the write half can be
//! driven from two threads at once. `std::net::TcpStream` has this shape
//! natively; [`TlsStream`] adds it on top of a rustls client session by
//! keeping the session state behind a lock that is never held across a
//! blocking socket read.

use std::io;
use std::net::TcpStream;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use rustls::pki_types::ServerName;

use crate::{Error, Result};

/// A full-duplex blocking byte stream with per-direction timeouts.
///
/// Reads and writes may be issued concurrently from different threads. The
/// timeouts apply to individual blocking calls; the connection converts its
/// absolute deadlines into timeouts before each call.
pub trait Stream: Send + Sync {
    /// Reads into `buf`, blocking until at least one byte is available, the
    /// read timeout expires, or the peer closes.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes all of `buf`, blocking as needed.
    fn write_all(&self, buf: &[u8]) -> io::Result<()>;

    /// Sets the timeout for subsequent reads; `None` blocks indefinitely.
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Sets the timeout for subsequent writes; `None` blocks indefinitely.
    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Shuts the stream down in both directions.
    fn shutdown(&self) -> io::Result<()>;
}

impl Stream for TcpStream {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(&mut &*self, buf)
    }

    fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        io::Write::write_all(&mut &*self, buf)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_write_timeout(self, timeout)
    }

    fn shutdown(&self) -> io::Result<()> {
        TcpStream::shutdown(self, std::net::Shutdown::Both)
    }
}

impl Stream for Box<dyn Stream> {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }

    fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        (**self).write_all(buf)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        (**self).set_read_timeout(timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        (**self).set_write_timeout(timeout)
    }

    fn shutdown(&self) -> io::Result<()> {
        (**self).shutdown()
    }
}

pub(crate) fn lock_ignore_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Adapts a `&T: Stream` into the `io::Read + io::Write` pair the rustls
/// session driver expects.
struct StreamIo<'a, T>(&'a T);

impl<T: Stream> io::Read for StreamIo<'_, T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl<T: Stream> io::Write for StreamIo<'_, T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Client-side TLS over any [`Stream`].
///
/// The rustls session is behind a mutex, but blocking socket reads happen
/// outside it: ciphertext is pulled from the inner stream into a scratch
/// buffer first and only then fed to the session. A reader blocked on the
/// socket therefore never starves a concurrent writer.
pub struct TlsStream<T> {
    session: Mutex<rustls::ClientConnection>,
    inner: T,
}

impl<T: Stream> TlsStream<T> {
    /// Runs a TLS client handshake for `server_name` over `inner`.
    pub fn client(inner: T, config: Arc<rustls::ClientConfig>, server_name: &str) -> Result<Self> {
        let name = ServerName::try_from(server_name.to_owned())
            .map_err(|_| Error::Io(io::Error::new(io::ErrorKind::InvalidInput, "invalid dns name")))?;
        let mut session = rustls::ClientConnection::new(config, name)
            .map_err(|err| Error::Io(io::Error::other(err)))?;

        let mut io = StreamIo(&inner);
        while session.is_handshaking() {
            session.complete_io(&mut io)?;
        }

        Ok(Self {
            session: Mutex::new(session),
            inner,
        })
    }

    /// Returns the stream the TLS session runs on.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    fn feed(&self, data: &[u8]) -> io::Result<()> {
        let mut session = lock_ignore_poison(&self.session);
        let mut slice = data;
        while !slice.is_empty() {
            if session.read_tls(&mut slice)? == 0 {
                break;
            }
            session.process_new_packets().map_err(io::Error::other)?;
        }
        // key updates and the like may queue records to send back
        if session.wants_write() {
            let mut io = StreamIo(&self.inner);
            while session.wants_write() {
                session.write_tls(&mut io)?;
            }
        }
        Ok(())
    }
}

impl<T: Stream> Stream for TlsStream<T> {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            {
                let mut session = lock_ignore_poison(&self.session);
                match io::Read::read(&mut session.reader(), buf) {
                    Ok(n) => return Ok(n),
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                    Err(err) => return Err(err),
                }
            }

            // No plaintext buffered; pull more ciphertext without holding
            // the session lock.
            let mut tmp = [0u8; 17 * 1024];
            let n = self.inner.read(&mut tmp)?;
            if n == 0 {
                return Ok(0);
            }
            self.feed(&tmp[..n])?;
        }
    }

    fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let mut session = lock_ignore_poison(&self.session);
        io::Write::write_all(&mut session.writer(), buf)?;
        let mut io = StreamIo(&self.inner);
        while session.wants_write() {
            session.write_tls(&mut io)?;
        }
        Ok(())
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.inner.set_read_timeout(timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.inner.set_write_timeout(timeout)
    }

    fn shutdown(&self) -> io::Result<()> {
        self.inner.shutdown()
    }
}

/// Default client TLS configuration: webpki roots, no client auth.
pub(crate) fn default_tls_config() -> Arc<rustls::ClientConfig> {
    static CONFIG: OnceLock<Arc<rustls::ClientConfig>> = OnceLock::new();
    CONFIG
        .get_or_init(|| {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let mut config = rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            config.alpn_protocols = vec![b"http/1.1".to_vec()];
            Arc::new(config)
        })
        .clone()
}
