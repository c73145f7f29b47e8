//! Output sinks: stdout, file, TCP, or UDP unicast/multicast.
//! UDP is the only sink that wants pacing; the others take data as fast as
//! the OS accepts it.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::net::{Ipv4Addr, SocketAddrV4, TcpStream, UdpSocket};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::info;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::error::Error;

/// TTL applied when the destination is a multicast group.
const MULTICAST_TTL: u32 = 5;

/// Destination spec, parsed from a string:
/// `udp://ADDR:PORT?iface=IP`, `tcp://HOST:PORT`, `file:PATH`, a bare file
/// path, or `-` for stdout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Stdout,
    File(PathBuf),
    Tcp(String),
    Udp {
        addr: SocketAddrV4,
        interface: Option<Ipv4Addr>,
    },
}

impl FromStr for Target {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        if s == "-" {
            return Ok(Target::Stdout);
        }
        if let Some(rest) = s.strip_prefix("udp://") {
            let (hostport, query) = match rest.find('?') {
                Some(pos) => (&rest[..pos], Some(&rest[pos + 1..])),
                None => (rest, None),
            };
            let addr = SocketAddrV4::from_str(hostport)
                .map_err(|_| Error::Config("udp target needs an IPv4 ADDR:PORT"))?;

            let mut interface = None;
            if let Some(query) = query {
                for param in query.split('&') {
                    let mut parts = param.splitn(2, '=');
                    let key = parts.next().unwrap_or("");
                    let value = parts.next().unwrap_or("");
                    match key {
                        "iface" | "interface" => {
                            interface = Some(
                                Ipv4Addr::from_str(value)
                                    .map_err(|_| Error::Config("invalid interface address"))?,
                            );
                        }
                        _ => {
                            // Ignore unknown parameters
                        }
                    }
                }
            }
            return Ok(Target::Udp { addr, interface });
        }
        if let Some(rest) = s.strip_prefix("tcp://") {
            if rest.is_empty() {
                return Err(Error::Config("tcp target needs HOST:PORT"));
            }
            return Ok(Target::Tcp(rest.to_string()));
        }
        let path = s.strip_prefix("file:").unwrap_or(s);
        if path.is_empty() {
            return Err(Error::Config("empty file path"));
        }
        Ok(Target::File(PathBuf::from(path)))
    }
}

/// An open output sink.
pub enum Sink {
    Stdout(io::Stdout),
    File(BufWriter<File>),
    Tcp(TcpStream),
    Udp(UdpSocket),
}

impl Sink {
    pub fn open(target: &Target) -> Result<Sink, Error> {
        match target {
            Target::Stdout => Ok(Sink::open_stdout()),
            Target::File(path) => Sink::open_file(path),
            Target::Tcp(hostport) => Sink::open_tcp(hostport),
            Target::Udp { addr, interface } => Sink::open_udp(*addr, *interface),
        }
    }

    pub fn open_stdout() -> Sink {
        Sink::Stdout(io::stdout())
    }

    pub fn open_file(path: &Path) -> Result<Sink, Error> {
        let file = File::create(path).map_err(Error::SinkSetup)?;
        Ok(Sink::File(BufWriter::new(file)))
    }

    /// Connect a blocking TCP stream. It stays blocking until a command
    /// channel is attached.
    pub fn open_tcp(hostport: &str) -> Result<Sink, Error> {
        let stream = TcpStream::connect(hostport).map_err(Error::SinkSetup)?;
        info!("tcp sink connected to {hostport}");
        Ok(Sink::Tcp(stream))
    }

    /// Create a UDP socket fixed on `dest`. A class-D destination gets the
    /// multicast TTL and, when given, the outgoing interface; the socket is
    /// then connected so sends need no per-packet address.
    pub fn open_udp(dest: SocketAddrV4, interface: Option<Ipv4Addr>) -> Result<Sink, Error> {
        let socket =
            Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(Error::SinkSetup)?;

        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
        socket
            .bind(&SockAddr::from(bind_addr))
            .map_err(Error::SinkSetup)?;

        if dest.ip().is_multicast() {
            socket
                .set_multicast_ttl_v4(MULTICAST_TTL)
                .map_err(Error::SinkSetup)?;
            if let Some(iface) = interface {
                socket
                    .set_multicast_if_v4(&iface)
                    .map_err(Error::SinkSetup)?;
            }
        }

        socket
            .connect(&SockAddr::from(dest))
            .map_err(Error::SinkSetup)?;
        info!("udp sink connected to {dest}");
        Ok(Sink::Udp(socket.into()))
    }

    pub fn is_udp(&self) -> bool {
        matches!(self, Sink::Udp(_))
    }

    /// Switch the TCP stream to non-blocking for command multiplexing.
    pub fn set_nonblocking(&mut self) -> Result<(), Error> {
        match self {
            Sink::Tcp(stream) => stream.set_nonblocking(true).map_err(Error::SinkSetup),
            _ => Err(Error::Config("command input needs a tcp sink")),
        }
    }

    /// Write all of `data`. On stream sinks short writes are retried until
    /// everything is out; a UDP datagram goes in one send.
    pub fn send_all(&mut self, data: &[u8]) -> Result<(), Error> {
        match self {
            Sink::Stdout(out) => out.write_all(data).map_err(Error::SinkWrite),
            Sink::File(file) => file.write_all(data).map_err(Error::SinkWrite),
            Sink::Tcp(stream) => {
                let mut sent = 0;
                while sent < data.len() {
                    match stream.write(&data[sent..]) {
                        Ok(0) => {
                            return Err(Error::SinkWrite(io::Error::new(
                                io::ErrorKind::WriteZero,
                                "peer stopped accepting bytes",
                            )))
                        }
                        Ok(n) => sent += n,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => return Err(Error::SinkWrite(e)),
                    }
                }
                Ok(())
            }
            Sink::Udp(socket) => {
                let n = socket.send(data).map_err(Error::SinkWrite)?;
                if n != data.len() {
                    return Err(Error::SinkWrite(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "datagram truncated",
                    )));
                }
                Ok(())
            }
        }
    }

    pub fn flush(&mut self) -> Result<(), Error> {
        match self {
            Sink::Stdout(out) => out.flush().map_err(Error::SinkWrite),
            Sink::File(file) => file.flush().map_err(Error::SinkWrite),
            Sink::Tcp(_) | Sink::Udp(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_udp_with_interface() {
        let target: Target = "udp://239.100.1.1:5004?iface=192.168.1.20".parse().unwrap();
        assert_eq!(
            target,
            Target::Udp {
                addr: "239.100.1.1:5004".parse().unwrap(),
                interface: Some(Ipv4Addr::new(192, 168, 1, 20)),
            }
        );
    }

    #[test]
    fn parses_plain_targets() {
        assert_eq!("-".parse::<Target>().unwrap(), Target::Stdout);
        assert_eq!(
            "tcp://localhost:8888".parse::<Target>().unwrap(),
            Target::Tcp("localhost:8888".to_string())
        );
        assert_eq!(
            "file:out.ts".parse::<Target>().unwrap(),
            Target::File(PathBuf::from("out.ts"))
        );
        assert_eq!(
            "out.ts".parse::<Target>().unwrap(),
            Target::File(PathBuf::from("out.ts"))
        );
    }

    #[test]
    fn rejects_bad_specs() {
        assert!("udp://not-an-ip:5004".parse::<Target>().is_err());
        assert!("udp://239.1.1.1:5004?iface=bogus".parse::<Target>().is_err());
        assert!("tcp://".parse::<Target>().is_err());
        assert!("".parse::<Target>().is_err());
    }

    #[test]
    fn file_sink_writes_bytes() {
        let path = std::env::temp_dir().join(format!("tscast-sink-{}.bin", std::process::id()));
        {
            let mut sink = Sink::open_file(&path).unwrap();
            sink.send_all(&[0x47, 1, 2, 3]).unwrap();
            sink.flush().unwrap();
        }
        let written = std::fs::read(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(written, vec![0x47, 1, 2, 3]);
    }

    #[test]
    fn udp_sink_sends_datagrams() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let dest = match receiver.local_addr().unwrap() {
            std::net::SocketAddr::V4(v4) => v4,
            other => panic!("unexpected addr {other}"),
        };
        let mut sink = Sink::open_udp(dest, None).unwrap();
        assert!(sink.is_udp());
        sink.send_all(&[0x47; 188]).unwrap();

        receiver
            .set_read_timeout(Some(std::time::Duration::from_secs(2)))
            .unwrap();
        let mut buf = [0u8; 400];
        let n = receiver.recv(&mut buf).unwrap();
        assert_eq!(n, 188);
        assert_eq!(buf[0], 0x47);
    }
}
