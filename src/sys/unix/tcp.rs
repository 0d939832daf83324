use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::RawFd;

use log::error;

/// Create a non-blocking listening socket bound to `address`.
///
/// Performs the full socket/setsockopt/bind/listen sequence; if any step
/// fails the partially created socket is closed before the error is
/// returned. On success also returns the actually bound address, which
/// differs from `address` when binding to port 0.
pub fn new_listener(address: SocketAddr, reuse_port: bool) -> io::Result<(RawFd, SocketAddr)> {
    let domain = match address {
        SocketAddr::V4(..) => libc::AF_INET,
        SocketAddr::V6(..) => libc::AF_INET6,
    };
    let fd = unsafe {
        libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, 0)
    };
    if fd == -1 {
        return Err(io::Error::last_os_error());
    }

    match bind_and_listen(fd, address, reuse_port) {
        Ok(local_address) => Ok((fd, local_address)),
        Err(err) => {
            close(fd);
            Err(err)
        },
    }
}

fn bind_and_listen(fd: RawFd, address: SocketAddr, reuse_port: bool) -> io::Result<SocketAddr> {
    set_socket_option(fd, libc::SO_REUSEADDR, 1)?;
    if reuse_port {
        set_socket_option(fd, libc::SO_REUSEPORT, 1)?;
    }

    let (storage, length) = socket_address(address);
    let storage_ptr: *const libc::sockaddr_storage = &storage;
    if unsafe { libc::bind(fd, storage_ptr as *const libc::sockaddr, length) } == -1 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::listen(fd, 1024) } == -1 {
        return Err(io::Error::last_os_error());
    }
    local_address(fd)
}

/// Accept a single pending connection, non-blocking.
///
/// The returned descriptor is itself non-blocking and close-on-exec.
pub fn accept(fd: RawFd) -> io::Result<(RawFd, SocketAddr)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut length = size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    let storage_ptr: *mut libc::sockaddr_storage = &mut storage;
    let conn_fd = unsafe {
        libc::accept4(fd, storage_ptr as *mut libc::sockaddr, &mut length,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC)
    };
    if conn_fd == -1 {
        return Err(io::Error::last_os_error());
    }

    match to_socket_address(&storage) {
        Ok(peer_address) => Ok((conn_fd, peer_address)),
        Err(err) => {
            close(conn_fd);
            Err(err)
        },
    }
}

/// Close a descriptor, logging a failure instead of returning it: at the
/// points we close there is nothing sensible left to do with the error.
pub fn close(fd: RawFd) {
    if unsafe { libc::close(fd) } == -1 {
        let err = io::Error::last_os_error();
        error!("error closing fd={}: {}", fd, err);
    }
}

fn local_address(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut length = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let storage_ptr: *mut libc::sockaddr_storage = &mut storage;
    if unsafe {
        libc::getsockname(fd, storage_ptr as *mut libc::sockaddr, &mut length)
    } == -1 {
        Err(io::Error::last_os_error())
    } else {
        to_socket_address(&storage)
    }
}

fn set_socket_option(fd: RawFd, option: libc::c_int, value: libc::c_int) -> io::Result<()> {
    let value_ptr: *const libc::c_int = &value;
    if unsafe {
        libc::setsockopt(fd, libc::SOL_SOCKET, option,
            value_ptr as *const libc::c_void,
            size_of::<libc::c_int>() as libc::socklen_t)
    } == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn socket_address(address: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let storage_ptr: *mut libc::sockaddr_storage = &mut storage;
    match address {
        SocketAddr::V4(address) => {
            let sin = unsafe { &mut *(storage_ptr as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = address.port().to_be();
            sin.sin_addr = libc::in_addr { s_addr: u32::from(*address.ip()).to_be() };
            (storage, size_of::<libc::sockaddr_in>() as libc::socklen_t)
        },
        SocketAddr::V6(address) => {
            let sin6 = unsafe { &mut *(storage_ptr as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = address.port().to_be();
            sin6.sin6_addr.s6_addr = address.ip().octets();
            sin6.sin6_flowinfo = address.flowinfo();
            sin6.sin6_scope_id = address.scope_id();
            (storage, size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        },
    }
}

fn to_socket_address(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    let storage_ptr: *const libc::sockaddr_storage = storage;
    match libc::c_int::from(storage.ss_family) {
        libc::AF_INET => {
            let sin = unsafe { &*(storage_ptr as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        },
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage_ptr as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Ok(SocketAddr::V6(SocketAddrV6::new(ip, u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo, sin6.sin6_scope_id)))
        },
        family => Err(io::Error::new(io::ErrorKind::InvalidInput,
            format!("unsupported address family: {}", family))),
    }
}
