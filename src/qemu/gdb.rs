//! Minimal GDB remote serial protocol client.
//!
//! Just enough of the protocol to arm one breakpoint on QEMU's gdbstub,
//! resume the guest and learn when it stops. Packets are framed as
//! `$payload#cs` where `cs` is the modulo-256 sum of the payload bytes.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

/// What the stub reported after a `continue`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReply {
    /// Target stopped with a signal (`S`/`T` packets). A breakpoint hit is SIGTRAP.
    Signal(u8),
    /// Target exited (`W`) or was terminated (`X`).
    Exited,
}

/// Client for QEMU's gdbstub.
pub struct GdbClient {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl GdbClient {
    /// Connect to the stub, retrying until `deadline`.
    ///
    /// QEMU opens the listening socket shortly after it starts, so the first
    /// few attempts are expected to be refused.
    pub fn connect(port: u16, deadline: Instant) -> io::Result<Self> {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        loop {
            match TcpStream::connect_timeout(&addr, Duration::from_millis(200)) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    stream.set_write_timeout(Some(Duration::from_secs(5)))?;
                    let reader = BufReader::new(stream.try_clone()?);
                    return Ok(Self { stream, reader });
                }
                Err(e) if Instant::now() >= deadline => return Err(e),
                Err(_) => std::thread::sleep(Duration::from_millis(50)),
            }
        }
    }

    /// Bound how long a single reply may take. `None` blocks indefinitely.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }

    /// Send a packet and return the stub's reply payload.
    pub fn request(&mut self, payload: &str) -> io::Result<String> {
        self.send(payload)?;
        self.recv()
    }

    /// Insert a software breakpoint at `addr` (`Z0`).
    pub fn insert_breakpoint(&mut self, addr: u64, kind: u8) -> io::Result<()> {
        let reply = self.request(&format!("Z0,{:x},{}", addr, kind))?;
        if reply == "OK" {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::Other,
                format!("stub refused breakpoint at {:#x}: {:?}", addr, reply),
            ))
        }
    }

    /// Resume the target. The stop reply arrives later through `wait_stop`.
    pub fn resume(&mut self) -> io::Result<()> {
        self.send("c")
    }

    /// Block until the target stops or exits.
    pub fn wait_stop(&mut self) -> io::Result<StopReply> {
        loop {
            let reply = self.recv()?;
            if let Some(stop) = parse_stop_reply(&reply) {
                return Ok(stop);
            }
            // `O` console packets and anything else are ignored.
        }
    }

    fn send(&mut self, payload: &str) -> io::Result<()> {
        self.stream.write_all(encode_packet(payload).as_bytes())?;
        self.stream.flush()
    }

    fn recv(&mut self) -> io::Result<String> {
        let payload = read_packet(&mut self.reader)?;
        self.stream.write_all(b"+")?;
        Ok(payload)
    }
}

fn checksum(payload: &str) -> u8 {
    payload.bytes().fold(0u8, |acc, b| acc.wrapping_add(b))
}

/// Frame a payload as `$payload#cs`.
pub fn encode_packet(payload: &str) -> String {
    format!("${}#{:02x}", payload, checksum(payload))
}

/// Read one framed packet, skipping acknowledgements and noise before `$`.
pub fn read_packet<R: BufRead>(reader: &mut R) -> io::Result<String> {
    let mut byte = [0u8; 1];
    loop {
        reader.read_exact(&mut byte)?;
        if byte[0] == b'$' {
            break;
        }
    }

    let mut body = Vec::new();
    reader.read_until(b'#', &mut body)?;
    if body.pop() != Some(b'#') {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "gdb packet truncated",
        ));
    }

    let mut cs = [0u8; 2];
    reader.read_exact(&mut cs)?;
    let payload = String::from_utf8_lossy(&body).into_owned();
    let expected = std::str::from_utf8(&cs)
        .ok()
        .and_then(|s| u8::from_str_radix(s, 16).ok());
    if expected != Some(checksum(&payload)) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("bad checksum on gdb packet {:?}", payload),
        ));
    }
    Ok(payload)
}

/// Interpret a stop reply packet; `None` for anything that is not one.
pub fn parse_stop_reply(payload: &str) -> Option<StopReply> {
    let kind = payload.chars().next()?;
    match kind {
        'S' | 'T' => payload
            .get(1..3)
            .and_then(|sig| u8::from_str_radix(sig, 16).ok())
            .map(StopReply::Signal),
        'W' | 'X' => Some(StopReply::Exited),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::net::TcpListener;

    #[test]
    fn encodes_with_checksum() {
        assert_eq!(encode_packet("c"), "$c#63");
        assert_eq!(encode_packet("OK"), "$OK#9a");
    }

    #[test]
    fn reads_packet_after_ack() {
        let mut input = Cursor::new(b"+$T05thread:01;#07".to_vec());
        assert_eq!(read_packet(&mut input).unwrap(), "T05thread:01;");
    }

    #[test]
    fn rejects_bad_checksum() {
        let mut input = Cursor::new(b"$OK#00".to_vec());
        let err = read_packet(&mut input).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn parses_stop_replies() {
        assert_eq!(parse_stop_reply("S05"), Some(StopReply::Signal(5)));
        assert_eq!(parse_stop_reply("T05thread:01;"), Some(StopReply::Signal(5)));
        assert_eq!(parse_stop_reply("W00"), Some(StopReply::Exited));
        assert_eq!(parse_stop_reply("OK"), None);
        assert_eq!(parse_stop_reply(""), None);
    }

    #[test]
    fn arms_breakpoint_against_fake_stub() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let stub = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(sock.try_clone().unwrap());
            let z0 = read_packet(&mut reader).unwrap();
            sock.write_all(format!("+{}", encode_packet("OK")).as_bytes()).unwrap();
            let cont = read_packet(&mut reader).unwrap();
            sock.write_all(format!("+{}", encode_packet("T05thread:01;")).as_bytes()).unwrap();
            (z0, cont)
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut client = GdbClient::connect(port, deadline).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        client.insert_breakpoint(0xffff_0000_0008_1234, 4).unwrap();
        client.resume().unwrap();
        assert_eq!(client.wait_stop().unwrap(), StopReply::Signal(5));

        let (z0, cont) = stub.join().unwrap();
        assert_eq!(z0, "Z0,ffff000000081234,4");
        assert_eq!(cont, "c");
    }
}
