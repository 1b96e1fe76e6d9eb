// src/bluetooth/mod.rs
//! Bluetooth plumbing shared by the client transport and the swap server
//!
//! Connections are plain byte streams; [`protocol`] frames requests and
//! responses on top of them. The RFCOMM socket implementation talks to the
//! Linux kernel directly. Other platforms, and tests, plug in their own
//! [`BluetoothConnector`].

pub mod protocol;

use crate::error::{Error, Result};
use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::str::FromStr;
use std::time::Duration;

/// RFCOMM channel used when none is configured
pub const DEFAULT_CHANNEL: u8 = 1;

/// 48-bit device address, most significant byte first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BluetoothAddress(pub [u8; 6]);

impl FromStr for BluetoothAddress {
    type Err = Error;

    /// Accepts `AA:BB:CC:DD:EE:FF` and the URL-safe `AA-BB-CC-DD-EE-FF`
    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split([':', '-']).collect();
        if parts.len() != 6 {
            return Err(Error::ParseError(format!("Invalid Bluetooth address: {s}")));
        }
        let mut bytes = [0u8; 6];
        for (byte, part) in bytes.iter_mut().zip(&parts) {
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| Error::ParseError(format!("Invalid Bluetooth address: {s}")))?;
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for BluetoothAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

/// Anything that can carry the byte stream of one connection
pub trait Duplex: Read + Write + Send {}

impl<T: Read + Write + Send> Duplex for T {}

/// Buffered, bidirectional connection to one peer
pub struct BluetoothConnection {
    inner: BufReader<Box<dyn Duplex>>,
}

impl BluetoothConnection {
    pub fn new(stream: impl Duplex + 'static) -> Self {
        Self {
            inner: BufReader::new(Box::new(stream)),
        }
    }
}

impl Read for BluetoothConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl BufRead for BluetoothConnection {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.inner.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.inner.consume(amt)
    }
}

impl Write for BluetoothConnection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.get_mut().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.get_mut().flush()
    }
}

/// Opens client connections to peers
pub trait BluetoothConnector: Send + Sync {
    fn connect(&self, address: BluetoothAddress, timeout: Duration) -> Result<BluetoothConnection>;
}

/// Connector using kernel RFCOMM sockets on a fixed channel
#[derive(Debug, Clone, Copy)]
pub struct RfcommConnector {
    pub channel: u8,
}

impl Default for RfcommConnector {
    fn default() -> Self {
        Self {
            channel: DEFAULT_CHANNEL,
        }
    }
}

impl BluetoothConnector for RfcommConnector {
    fn connect(&self, address: BluetoothAddress, timeout: Duration) -> Result<BluetoothConnection> {
        let stream = rfcomm::connect(address, self.channel, timeout)
            .map_err(|e| Error::from_io(&format!("bluetooth://{address}"), e))?;
        Ok(BluetoothConnection::new(stream))
    }
}

pub use rfcomm::RfcommListener;

#[cfg(target_os = "linux")]
mod rfcomm {
    use super::BluetoothAddress;
    use std::fs::File;
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
    use std::time::Duration;

    const AF_BLUETOOTH: libc::c_int = 31;
    const BTPROTO_RFCOMM: libc::c_int = 3;

    #[repr(C)]
    struct SockaddrRc {
        rc_family: libc::sa_family_t,
        rc_bdaddr: [u8; 6],
        rc_channel: u8,
    }

    impl SockaddrRc {
        fn new(address: BluetoothAddress, channel: u8) -> Self {
            // bdaddr_t is little-endian
            let mut bdaddr = address.0;
            bdaddr.reverse();
            Self {
                rc_family: AF_BLUETOOTH as libc::sa_family_t,
                rc_bdaddr: bdaddr,
                rc_channel: channel,
            }
        }
    }

    fn socket() -> io::Result<OwnedFd> {
        let fd = unsafe {
            libc::socket(
                AF_BLUETOOTH,
                libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
                BTPROTO_RFCOMM,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    fn set_timeouts(fd: &OwnedFd, timeout: Duration) -> io::Result<()> {
        let tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };
        for option in [libc::SO_RCVTIMEO, libc::SO_SNDTIMEO] {
            let result = unsafe {
                libc::setsockopt(
                    fd.as_raw_fd(),
                    libc::SOL_SOCKET,
                    option,
                    &tv as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::timeval>() as libc::socklen_t,
                )
            };
            if result == -1 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    /// Connected RFCOMM socket; reads and writes go straight to the fd
    pub fn connect(address: BluetoothAddress, channel: u8, timeout: Duration) -> io::Result<File> {
        let fd = socket()?;
        set_timeouts(&fd, timeout)?;
        let addr = SockaddrRc::new(address, channel);
        let result = unsafe {
            libc::connect(
                fd.as_raw_fd(),
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<SockaddrRc>() as libc::socklen_t,
            )
        };
        if result == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(File::from(fd))
    }

    /// Listening RFCOMM socket bound to any local adapter
    pub struct RfcommListener {
        fd: OwnedFd,
    }

    impl RfcommListener {
        pub fn bind(channel: u8) -> io::Result<Self> {
            let fd = socket()?;
            let addr = SockaddrRc::new(BluetoothAddress([0; 6]), channel);
            let result = unsafe {
                libc::bind(
                    fd.as_raw_fd(),
                    &addr as *const _ as *const libc::sockaddr,
                    std::mem::size_of::<SockaddrRc>() as libc::socklen_t,
                )
            };
            if result == -1 {
                return Err(io::Error::last_os_error());
            }
            if unsafe { libc::listen(fd.as_raw_fd(), 1) } == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(Self { fd })
        }

        pub fn accept(&self) -> io::Result<File> {
            let fd = unsafe {
                libc::accept4(
                    self.fd.as_raw_fd(),
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    libc::SOCK_CLOEXEC,
                )
            };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(File::from(unsafe { OwnedFd::from_raw_fd(fd) }))
        }

        /// Wake a thread blocked in `accept`
        pub fn shutdown(&self) {
            unsafe {
                libc::shutdown(self.fd.as_raw_fd(), libc::SHUT_RDWR);
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod rfcomm {
    use super::BluetoothAddress;
    use std::fs::File;
    use std::io;
    use std::time::Duration;

    fn unsupported() -> io::Error {
        io::Error::new(
            io::ErrorKind::Unsupported,
            "RFCOMM sockets are only supported on Linux",
        )
    }

    pub fn connect(_address: BluetoothAddress, _channel: u8, _timeout: Duration) -> io::Result<File> {
        Err(unsupported())
    }

    pub struct RfcommListener;

    impl RfcommListener {
        pub fn bind(_channel: u8) -> io::Result<Self> {
            Err(unsupported())
        }

        pub fn accept(&self) -> io::Result<File> {
            Err(unsupported())
        }

        pub fn shutdown(&self) {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_parsing() {
        let addr: BluetoothAddress = "00-1A-7d-DA-71-13".parse().unwrap();
        assert_eq!(addr.0, [0x00, 0x1a, 0x7d, 0xda, 0x71, 0x13]);
        assert_eq!(addr.to_string(), "00:1A:7D:DA:71:13");
        assert_eq!("00:1A:7D:DA:71:13".parse::<BluetoothAddress>().unwrap(), addr);

        assert!("00-1A-7D".parse::<BluetoothAddress>().is_err());
        assert!("zz-1A-7D-DA-71-13".parse::<BluetoothAddress>().is_err());
    }

    #[test]
    fn test_connection_reads_and_writes() {
        let mut conn = BluetoothConnection::new(io::Cursor::new(b"200\n\n".to_vec()));
        let mut line = String::new();
        conn.read_line(&mut line).unwrap();
        assert_eq!(line, "200\n");
        conn.write_all(b"x").unwrap();
    }
}
