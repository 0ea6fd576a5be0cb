//! Listener setup, the accept pair, and the handful of raw socket calls
//! the connection path needs. File descriptors cross this boundary as
//! plain `RawFd`s; ownership (and the duty to `close`) stays with the
//! caller.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::RawFd;

use libc::{self, c_int, c_void, sockaddr_storage, socklen_t};

pub fn close(fd: RawFd) -> io::Result<()> {
    syscall!(close(fd)).map(|_| ())
}

pub fn set_nonblocking(fd: RawFd, nonblocking: bool) -> io::Result<()> {
    let mut nonblocking = nonblocking as c_int;
    syscall!(ioctl(fd, libc::FIONBIO, &mut nonblocking)).map(|_| ())
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = syscall!(fcntl(fd, libc::F_GETFD))?;
    syscall!(fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC)).map(|_| ())
}

/// Creates a nonblocking, close-on-exec stream socket bound to `addr`
/// with `SO_REUSEADDR` set. The caller follows up with [`listen`].
pub fn bind(addr: SocketAddr) -> io::Result<RawFd> {
    let family = match addr {
        SocketAddr::V4(..) => libc::AF_INET,
        SocketAddr::V6(..) => libc::AF_INET6,
    };

    let fd = syscall!(socket(
        family,
        libc::SOCK_STREAM | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
        0
    ))?;

    let res = bind_inner(fd, addr);
    if let Err(err) = res {
        let _ = close(fd);
        return Err(err);
    }

    Ok(fd)
}

fn bind_inner(fd: RawFd, addr: SocketAddr) -> io::Result<()> {
    let reuse: c_int = 1;
    syscall!(setsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_REUSEADDR,
        &reuse as *const c_int as *const c_void,
        mem::size_of::<c_int>() as socklen_t
    ))?;

    let (storage, len) = addr_into_storage(addr);
    syscall!(bind(fd, &storage as *const _ as *const libc::sockaddr, len))?;

    Ok(())
}

pub fn listen(fd: RawFd, backlog: c_int) -> io::Result<()> {
    syscall!(listen(fd, backlog)).map(|_| ())
}

/// `accept4(2)` with `SOCK_NONBLOCK | SOCK_CLOEXEC`. The returned errno
/// is left for the caller to classify; `ENOSYS` in particular drives the
/// acceptor's fallback probe.
pub fn accept4(fd: RawFd) -> io::Result<(RawFd, SocketAddr)> {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of_val(&storage) as socklen_t;

    let sock = syscall!(accept4(
        fd,
        &mut storage as *mut _ as *mut libc::sockaddr,
        &mut len,
        libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC
    ))?;

    finish_accept(sock, &storage, len)
}

/// Plain `accept(2)` for kernels without `accept4`, followed by explicit
/// nonblocking and close-on-exec setup.
pub fn accept(fd: RawFd) -> io::Result<(RawFd, SocketAddr)> {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of_val(&storage) as socklen_t;

    let sock = syscall!(accept(
        fd,
        &mut storage as *mut _ as *mut libc::sockaddr,
        &mut len
    ))?;

    if let Err(err) = set_nonblocking(sock, true).and_then(|_| set_cloexec(sock)) {
        let _ = close(sock);
        return Err(err);
    }

    finish_accept(sock, &storage, len)
}

fn finish_accept(
    sock: RawFd,
    storage: &sockaddr_storage,
    len: socklen_t,
) -> io::Result<(RawFd, SocketAddr)> {
    match sockaddr_to_addr(storage, len as usize) {
        Ok(peer) => Ok((sock, peer)),
        Err(err) => {
            let _ = close(sock);
            Err(err)
        }
    }
}

pub fn recv(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = syscall!(recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), 0))?;
    Ok(n as usize)
}

pub fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of_val(&storage) as socklen_t;

    syscall!(getsockname(
        fd,
        &mut storage as *mut _ as *mut libc::sockaddr,
        &mut len
    ))?;

    sockaddr_to_addr(&storage, len as usize)
}

/// Opens the idle reserve descriptor held against `EMFILE`; `/dev/null`
/// because it is always there and costs nothing.
pub fn open_idle_fd() -> io::Result<RawFd> {
    syscall!(open(
        b"/dev/null\0".as_ptr() as *const libc::c_char,
        libc::O_RDONLY | libc::O_CLOEXEC
    ))
}

fn addr_into_storage(addr: SocketAddr) -> (sockaddr_storage, socklen_t) {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };

    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from(*v4.ip()).to_be(),
                },
                sin_zero: [0; 8],
            };
            unsafe { *(&mut storage as *mut _ as *mut libc::sockaddr_in) = sin };
            (storage, mem::size_of::<libc::sockaddr_in>() as socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe { *(&mut storage as *mut _ as *mut libc::sockaddr_in6) = sin6 };
            (storage, mem::size_of::<libc::sockaddr_in6>() as socklen_t)
        }
    }
}

pub fn sockaddr_to_addr(storage: &sockaddr_storage, len: usize) -> io::Result<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            assert!(len >= mem::size_of::<libc::sockaddr_in>());
            let sin = unsafe { *(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Ok(SocketAddr::V4(SocketAddrV4::new(
                ip,
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            assert!(len >= mem::size_of::<libc::sockaddr_in6>());
            let sin6 = unsafe { *(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "address family not supported",
        )),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;
    use std::net::TcpStream;

    #[test]
    fn bind_listen_accept() {
        let fd = bind("127.0.0.1:0".parse().unwrap()).unwrap();
        listen(fd, 16).unwrap();

        let addr = local_addr(fd).unwrap();
        assert_ne!(addr.port(), 0);

        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"x").unwrap();

        // the listener is nonblocking; the connection may take a moment
        // to land in the backlog
        let (sock, peer) = loop {
            match accept4(fd) {
                Ok(pair) => break pair,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                Err(e) => panic!("accept4 failed: {}", e),
            }
        };

        assert_eq!(peer.ip(), client.local_addr().unwrap().ip());
        assert_eq!(peer.port(), client.local_addr().unwrap().port());

        let mut buf = [0u8; 8];
        let n = loop {
            match recv(sock, &mut buf) {
                Ok(n) => break n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                Err(e) => panic!("recv failed: {}", e),
            }
        };
        assert_eq!(&buf[..n], b"x");

        close(sock).unwrap();
        close(fd).unwrap();
    }

    #[test]
    fn idle_fd_opens_and_reopens() {
        let fd = open_idle_fd().unwrap();
        close(fd).unwrap();
        let fd = open_idle_fd().unwrap();
        close(fd).unwrap();
    }
}
