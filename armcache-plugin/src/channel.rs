//! Length-prefixed TCP control channel to the injection-plan supervisor.
//!
//! Frames are a 4-byte big-endian length followed by that many payload
//! bytes, matching the reference plugin's `send_len`/`read_len` framing.
//! Payloads are themselves ASCII (decimal or hex, depending on direction).

use std::io::{self, Read, Write};
use std::net::TcpStream;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("control channel I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("control channel payload was not valid UTF-8")]
    NotUtf8,
}

pub struct ControlChannel {
    stream: TcpStream,
}

impl ControlChannel {
    pub fn connect(hostname: &str, port: u16) -> Result<Self, ChannelError> {
        let stream = TcpStream::connect((hostname, port))?;
        stream.set_nodelay(true)?;
        Ok(ControlChannel { stream })
    }

    fn send_raw(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        self.stream.write_all(&(data.len() as u32).to_be_bytes())?;
        self.stream.write_all(data)?;
        Ok(())
    }

    fn read_raw(&mut self) -> Result<Vec<u8>, ChannelError> {
        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf)?;
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        if len > 0 {
            self.stream.read_exact(&mut buf)?;
        }
        Ok(buf)
    }

    pub fn send_str(&mut self, message: &str) -> Result<(), ChannelError> {
        self.send_raw(message.as_bytes())
    }

    pub fn send_byte(&mut self, byte: u8) -> Result<(), ChannelError> {
        self.send_raw(&[byte])
    }

    pub fn recv_str(&mut self) -> Result<String, ChannelError> {
        String::from_utf8(self.read_raw()?).map_err(|_| ChannelError::NotUtf8)
    }

    pub fn shutdown(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn round_trips_a_framed_string() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut len_buf = [0u8; 4];
            sock.read_exact(&mut len_buf).unwrap();
            let len = u32::from_be_bytes(len_buf) as usize;
            let mut buf = vec![0u8; len];
            sock.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"1000");
            let reply = b"0x00001004";
            sock.write_all(&(reply.len() as u32).to_be_bytes()).unwrap();
            sock.write_all(reply).unwrap();
        });

        let mut channel = ControlChannel::connect("127.0.0.1", port).unwrap();
        channel.send_str("1000").unwrap();
        assert_eq!(channel.recv_str().unwrap(), "0x00001004");

        server.join().unwrap();
    }
}
