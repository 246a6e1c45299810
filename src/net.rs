use std::str::FromStr;
use std::{
    fmt, fs, io,
    net::{AddrParseError, SocketAddr, ToSocketAddrs},
    path::PathBuf,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use log::*;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::{tcp, unix, TcpListener, TcpStream, UnixListener, UnixStream},
    time::timeout,
};

/// Unify behavior of tcp & unix addr
pub enum UnifyAddr {
    Socket(SocketAddr),
    Path(PathBuf),
}

impl fmt::Display for UnifyAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Socket(s) => write!(f, "{}", s),
            Self::Path(p) => write!(f, "{}", p.display()),
        }
    }
}

impl fmt::Debug for UnifyAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Clone for UnifyAddr {
    fn clone(&self) -> Self {
        match self {
            Self::Socket(s) => UnifyAddr::Socket(s.clone()),
            Self::Path(p) => UnifyAddr::Path(p.clone()),
        }
    }
}

impl FromStr for UnifyAddr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with('/') {
            return Ok(Self::Path(PathBuf::from(s)));
        }
        match s.parse::<SocketAddr>() {
            Ok(a) => Ok(Self::Socket(a)),
            // Can't directly resolve the IP, try to resolve it through the domain name.
            // If multiple IP addresses are resolved, only the first result is taken
            Err(e) => match s.to_socket_addrs() {
                Ok(mut _v) => match _v.next() {
                    Some(a) => Ok(Self::Socket(a)),
                    None => Err(e),
                },
                Err(_) => Err(e),
            },
        }
    }
}

impl UnifyAddr {
    /// Resolve an address for an explicit network name ("tcp" or "unix").
    pub fn for_network(network: &str, address: &str) -> io::Result<Self> {
        match network {
            "tcp" => match Self::from_str(address) {
                Ok(a @ UnifyAddr::Socket(_)) => Ok(a),
                _ => Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("invalid tcp address {}", address),
                )),
            },
            "unix" => Ok(Self::Path(PathBuf::from(address))),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported network {}", network),
            )),
        }
    }
}

/// Unify behavior of tcp & unix socket listener
pub enum UnifyListener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl UnifyListener {
    pub async fn bind(addr: &UnifyAddr) -> io::Result<Self> {
        match addr {
            UnifyAddr::Socket(_addr) => match TcpListener::bind(_addr).await {
                Ok(l) => Ok(UnifyListener::Tcp(l)),
                Err(e) => Err(e),
            },
            UnifyAddr::Path(path) => {
                if path.exists() {
                    fs::remove_file(path)?;
                }
                match UnixListener::bind(path) {
                    Ok(l) => Ok(UnifyListener::Unix(l)),
                    Err(e) => Err(e),
                }
            }
        }
    }

    #[inline]
    pub async fn accept(&mut self) -> io::Result<UnifyStream> {
        match self {
            UnifyListener::Tcp(l) => match l.accept().await {
                Ok((stream, _)) => Ok(UnifyStream::Tcp(stream)),
                Err(e) => Err(e),
            },
            UnifyListener::Unix(l) => match l.accept().await {
                Ok((stream, _)) => Ok(UnifyStream::Unix(stream)),
                Err(e) => Err(e),
            },
        }
    }

    pub fn local_addr(&self) -> io::Result<String> {
        match self {
            UnifyListener::Tcp(l) => Ok(l.local_addr()?.to_string()),
            UnifyListener::Unix(l) => {
                let addr = l.local_addr()?;
                match addr.as_pathname() {
                    Some(p) => Ok(p.display().to_string()),
                    None => Ok(String::new()),
                }
            }
        }
    }
}

impl fmt::Display for UnifyListener {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.local_addr() {
            Ok(addr) => write!(f, "listener {}", addr),
            Err(_) => write!(f, "listener unknown"),
        }
    }
}

/// Unify behavior of tcp & unix stream
pub enum UnifyStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl UnifyStream {
    #[inline]
    pub async fn connect(addr: &UnifyAddr) -> io::Result<Self> {
        match addr {
            UnifyAddr::Socket(_addr) => match TcpStream::connect(_addr).await {
                Ok(stream) => Ok(UnifyStream::Tcp(stream)),
                Err(e) => Err(e),
            },
            UnifyAddr::Path(path) => match UnixStream::connect(path).await {
                Ok(stream) => Ok(UnifyStream::Unix(stream)),
                Err(e) => Err(e),
            },
        }
    }

    pub async fn connect_timeout(
        addr: &UnifyAddr, connect_timeout: Duration,
    ) -> io::Result<Self> {
        if connect_timeout.is_zero() {
            return UnifyStream::connect(addr).await;
        }
        match timeout(connect_timeout, UnifyStream::connect(addr)).await {
            Ok(r) => r,
            Err(e) => {
                debug!("connect {} timeout: {}", addr, e);
                Err(e.into())
            }
        }
    }

    /// Split into independently owned read and write ends, so a reader task
    /// and a send-lock guarded writer never share the stream.
    pub fn into_split(self) -> (UnifyReadHalf, UnifyWriteHalf) {
        match self {
            UnifyStream::Tcp(s) => {
                let (r, w) = s.into_split();
                (UnifyReadHalf::Tcp(r), UnifyWriteHalf::Tcp(w))
            }
            UnifyStream::Unix(s) => {
                let (r, w) = s.into_split();
                (UnifyReadHalf::Unix(r), UnifyWriteHalf::Unix(w))
            }
        }
    }
}

impl fmt::Display for UnifyStream {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Tcp(s) => match (s.local_addr(), s.peer_addr()) {
                (Ok(local), Ok(peer)) => write!(f, "{}->{}", local, peer),
                (Ok(local), Err(_)) => write!(f, "{}", local),
                _ => write!(f, "tcp addr unknown"),
            },
            Self::Unix(s) => match s.local_addr() {
                Ok(addr) => match addr.as_pathname() {
                    Some(p) => write!(f, "{}", p.display()),
                    None => write!(f, "unixsocket"),
                },
                Err(_) => write!(f, "unixsocket addr unknown"),
            },
        }
    }
}

pub enum UnifyReadHalf {
    Tcp(tcp::OwnedReadHalf),
    Unix(unix::OwnedReadHalf),
}

pub enum UnifyWriteHalf {
    Tcp(tcp::OwnedWriteHalf),
    Unix(unix::OwnedWriteHalf),
}

impl AsyncRead for UnifyReadHalf {
    #[inline(always)]
    fn poll_read(
        self: Pin<&mut Self>, cx: &mut Context, buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match Pin::get_mut(self) {
            UnifyReadHalf::Tcp(r) => Pin::new(r).poll_read(cx, buf),
            UnifyReadHalf::Unix(r) => Pin::new(r).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UnifyWriteHalf {
    #[inline(always)]
    fn poll_write(
        self: Pin<&mut Self>, cx: &mut Context, buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match Pin::get_mut(self) {
            UnifyWriteHalf::Tcp(w) => Pin::new(w).poll_write(cx, buf),
            UnifyWriteHalf::Unix(w) => Pin::new(w).poll_write(cx, buf),
        }
    }

    #[inline(always)]
    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        match Pin::get_mut(self) {
            UnifyWriteHalf::Tcp(w) => Pin::new(w).poll_flush(cx),
            UnifyWriteHalf::Unix(w) => Pin::new(w).poll_flush(cx),
        }
    }

    #[inline(always)]
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        match Pin::get_mut(self) {
            UnifyWriteHalf::Tcp(w) => Pin::new(w).poll_shutdown(cx),
            UnifyWriteHalf::Unix(w) => Pin::new(w).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_addr_parse() {
        match UnifyAddr::from_str("127.0.0.1:18555").expect("parse") {
            UnifyAddr::Socket(s) => assert_eq!(s.port(), 18555),
            _ => panic!("expected socket addr"),
        }
        match UnifyAddr::from_str("/tmp/geerpc.sock").expect("parse") {
            UnifyAddr::Path(p) => assert_eq!(p, Path::new("/tmp/geerpc.sock")),
            _ => panic!("expected path addr"),
        }
    }

    #[test]
    fn test_addr_for_network() {
        assert!(matches!(
            UnifyAddr::for_network("tcp", "127.0.0.1:0"),
            Ok(UnifyAddr::Socket(_))
        ));
        assert!(matches!(
            UnifyAddr::for_network("unix", "/tmp/geerpc.sock"),
            Ok(UnifyAddr::Path(_))
        ));
        assert!(UnifyAddr::for_network("udp", "127.0.0.1:0").is_err());
        assert!(UnifyAddr::for_network("tcp", "/tmp/geerpc.sock").is_err());
    }
}
