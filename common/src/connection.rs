use std::{
    io::{self, Read, Write},
    net::Shutdown,
    time::Duration,
};

use serde::{de::DeserializeOwned, Serialize};

use crate::{
    codec::Codec,
    config::{Context, DEFAULT_MAX_FRAME_LEN},
    error::{IpcError, Result},
    platform_socket::{socket_pair, PeerCredentials, PlatformSocket},
};

/// Frames up to this size go out as a single write
const SMALL_FRAME: usize = 16 * 1024;

/// Header value announcing an 8-byte length follows
const LONG_FRAME_MARKER: i32 = -1;

/// Framed send/recv over one transport endpoint.
///
/// Every message is one length-prefixed frame: a 4-byte big-endian signed
/// length, or `-1` followed by an 8-byte big-endian length for frames past
/// `i32::MAX`. Not safe for concurrent writers without external locking.
pub struct Connection {
    socket:        Option<PlatformSocket>,
    readable:      bool,
    writable:      bool,
    codec:         Codec,
    max_frame_len: usize,
}

impl Connection {
    /// Wrap a connected endpoint that can both read and write
    pub fn new(socket: PlatformSocket) -> Self {
        Self::with_mode(socket, true, true)
    }

    /// Wrap an endpoint restricted to the given directions
    pub fn with_mode(socket: PlatformSocket, readable: bool, writable: bool) -> Self {
        Self {
            socket: Some(socket),
            readable,
            writable,
            codec: Codec::Bincode,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    /// Wrap an endpoint using the codec and frame limit from `ctx`
    pub fn from_context(socket: PlatformSocket, ctx: &Context) -> Self {
        Self::new(socket).configure(ctx)
    }

    /// Adopt the codec and frame limit from `ctx`
    pub fn configure(mut self, ctx: &Context) -> Self {
        self.codec = ctx.codec;
        self.max_frame_len = ctx.max_frame_len;
        self
    }

    pub fn readable(&self) -> bool {
        self.readable
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn closed(&self) -> bool {
        self.socket.is_none()
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    fn socket(&self) -> Result<&PlatformSocket> {
        self.socket.as_ref().ok_or(IpcError::Closed)
    }

    fn socket_mut(&mut self) -> Result<&mut PlatformSocket> {
        self.socket.as_mut().ok_or(IpcError::Closed)
    }

    fn check_readable(&self) -> Result<()> {
        self.socket()?;
        if self.readable {
            Ok(())
        } else {
            Err(IpcError::BadMode("readable"))
        }
    }

    fn check_writable(&self) -> Result<()> {
        self.socket()?;
        if self.writable {
            Ok(())
        } else {
            Err(IpcError::BadMode("writable"))
        }
    }

    /// Send one frame containing `payload`
    pub fn send_bytes(&mut self, payload: &[u8]) -> Result<()> {
        self.check_writable()?;
        let socket = self.socket_mut()?;

        let len = payload.len();
        if len > i32::MAX as usize {
            socket.write_all(&LONG_FRAME_MARKER.to_be_bytes())?;
            socket.write_all(&(len as u64).to_be_bytes())?;
            socket.write_all(payload)?;
        } else if len > SMALL_FRAME {
            socket.write_all(&(len as i32).to_be_bytes())?;
            socket.write_all(payload)?;
        } else {
            let mut frame = Vec::with_capacity(4 + len);
            frame.extend_from_slice(&(len as i32).to_be_bytes());
            frame.extend_from_slice(payload);
            socket.write_all(&frame)?;
        }

        socket.flush()?;
        Ok(())
    }

    /// Block until a whole frame arrives and return its payload
    pub fn recv_bytes(&mut self) -> Result<Vec<u8>> {
        let limit = self.max_frame_len;
        self.recv_bytes_limited(limit)
    }

    /// Like [`recv_bytes`](Self::recv_bytes) with an explicit size limit
    pub fn recv_bytes_limited(&mut self, max: usize) -> Result<Vec<u8>> {
        self.check_readable()?;
        let socket = self.socket_mut()?;

        let mut header = [0u8; 4];
        read_exact(socket, &mut header)?;
        let len = match i32::from_be_bytes(header) {
            LONG_FRAME_MARKER => {
                let mut long = [0u8; 8];
                read_exact(socket, &mut long)?;
                u64::from_be_bytes(long)
            }
            n if n < 0 => {
                return Err(IpcError::Decode(format!("negative frame length {n}")));
            }
            n => n as u64,
        };

        if len > max as u64 {
            return Err(IpcError::FrameTooLarge { len, max });
        }

        let mut payload = vec![0u8; len as usize];
        read_exact(socket, &mut payload)?;
        Ok(payload)
    }

    /// Encode `value` with this connection's codec and send it
    pub fn send<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        let payload = self.codec.encode(value)?;
        self.send_bytes(&payload)
    }

    /// Receive one frame and decode it with whichever codec tagged it
    pub fn recv<T: DeserializeOwned>(&mut self) -> Result<T> {
        let payload = self.recv_bytes()?;
        Codec::decode(&payload)
    }

    /// Whether a frame can be read within `timeout` (`None` waits forever).
    /// A closed peer also reports ready; the next recv then fails with
    /// [`IpcError::Eof`].
    pub fn poll(&self, timeout: Option<Duration>) -> Result<bool> {
        self.check_readable()?;
        Ok(self.socket()?.poll_readable(timeout)?)
    }

    /// Another Connection on the same endpoint, with the same mode and codec.
    ///
    /// Each handle closes independently; the endpoint stays open until both
    /// are closed.
    pub fn try_clone(&self) -> Result<Connection> {
        Ok(Self {
            socket:        Some(self.socket()?.try_clone()?),
            readable:      self.readable,
            writable:      self.writable,
            codec:         self.codec,
            max_frame_len: self.max_frame_len,
        })
    }

    /// Apply a read timeout to the underlying endpoint
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        Ok(self.socket()?.set_read_timeout(timeout)?)
    }

    /// Credentials of the peer process, where the transport exposes them
    pub fn peer_credentials(&self) -> Result<PeerCredentials> {
        self.socket()?.peer_credentials()
    }

    /// Release this handle on the endpoint. Safe to call more than once.
    ///
    /// Duplicates inherited by forked children stay open; the peer sees
    /// end-of-stream once every copy is closed.
    pub fn close(&mut self) {
        drop(self.socket.take());
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("closed", &self.closed())
            .field("readable", &self.readable)
            .field("writable", &self.writable)
            .field("codec", &self.codec)
            .finish()
    }
}

fn read_exact(socket: &mut PlatformSocket, buf: &mut [u8]) -> Result<()> {
    socket.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => IpcError::Eof,
        _ => IpcError::Io(e),
    })
}

/// A connected pair of Connections.
///
/// With `duplex` both ends read and write. Otherwise the first end is
/// read-only and the second write-only.
pub fn pipe(duplex: bool, ctx: &Context) -> Result<(Connection, Connection)> {
    let (a, b) = socket_pair()?;
    if duplex {
        return Ok((Connection::from_context(a, ctx), Connection::from_context(b, ctx)));
    }

    a.shutdown(Shutdown::Write)?;
    b.shutdown(Shutdown::Read)?;
    Ok((
        Connection::with_mode(a, true, false).configure(ctx),
        Connection::with_mode(b, false, true).configure(ctx),
    ))
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, thread};

    use super::*;

    #[test]
    fn frames_preserve_boundaries() {
        let (mut a, mut b) = pipe(true, &Context::default()).unwrap();
        a.send_bytes(b"").unwrap();
        a.send_bytes(b"hello").unwrap();
        a.send_bytes(&vec![7u8; SMALL_FRAME + 10]).unwrap();

        assert_eq!(b.recv_bytes().unwrap(), b"");
        assert_eq!(b.recv_bytes().unwrap(), b"hello");
        assert_eq!(b.recv_bytes().unwrap().len(), SMALL_FRAME + 10);
    }

    #[test]
    fn header_is_big_endian_length() {
        let (mut reader, mut writer) = pipe(false, &Context::default()).unwrap();
        writer.send_bytes(b"abc").unwrap();

        let socket = reader.socket_mut().unwrap();
        let mut raw = [0u8; 7];
        socket.read_exact(&mut raw).unwrap();
        assert_eq!(raw, [0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn typed_values_cross_a_duplex_pipe() {
        let (mut a, mut b) = pipe(true, &Context::default()).unwrap();

        let handle = thread::spawn(move || {
            let request: HashMap<String, Vec<u32>> = b.recv().unwrap();
            let total: u32 = request.values().flatten().sum();
            b.send(&total).unwrap();
        });

        let mut request = HashMap::new();
        request.insert("xs".to_string(), vec![1, 2, 3]);
        request.insert("ys".to_string(), vec![10]);
        a.send(&request).unwrap();
        assert_eq!(a.recv::<u32>().unwrap(), 16);
        handle.join().unwrap();
    }

    #[test]
    fn one_way_ends_reject_the_wrong_direction() {
        let (mut reader, mut writer) = pipe(false, &Context::default()).unwrap();
        assert!(matches!(reader.send_bytes(b"x"), Err(IpcError::BadMode("writable"))));
        assert!(matches!(writer.recv_bytes(), Err(IpcError::BadMode("readable"))));
    }

    #[test]
    fn peer_close_is_end_of_stream() {
        let (mut reader, mut writer) = pipe(false, &Context::default()).unwrap();
        writer.send_bytes(b"last").unwrap();
        writer.close();
        writer.close();

        assert!(writer.closed());
        assert_eq!(reader.recv_bytes().unwrap(), b"last");
        assert!(reader.poll(Some(Duration::ZERO)).unwrap());
        assert!(matches!(reader.recv_bytes(), Err(IpcError::Eof)));
    }

    #[test]
    fn cloned_reader_polls_the_same_endpoint() {
        let (reader, mut writer) = pipe(false, &Context::default()).unwrap();
        let mut observer = reader.try_clone().unwrap();
        assert!(observer.readable() && !observer.writable());
        assert!(!observer.poll(Some(Duration::ZERO)).unwrap());

        writer.send_bytes(b"seen").unwrap();
        assert!(observer.poll(Some(Duration::from_secs(1))).unwrap());

        // Closing one handle leaves the other usable
        observer.close();
        let mut reader = reader;
        assert_eq!(reader.recv_bytes().unwrap(), b"seen");
    }

    #[test]
    fn closed_handle_rejects_io() {
        let (mut a, _b) = pipe(true, &Context::default()).unwrap();
        a.close();
        assert!(matches!(a.send_bytes(b"x"), Err(IpcError::Closed)));
        assert!(matches!(a.recv_bytes(), Err(IpcError::Closed)));
        assert!(matches!(a.poll(None), Err(IpcError::Closed)));
    }

    #[test]
    fn oversized_frames_are_refused() {
        let ctx = Context::default().max_frame_len(8);
        let (mut reader, mut writer) = pipe(false, &ctx).unwrap();
        writer.send_bytes(&[0u8; 9]).unwrap();
        assert!(matches!(
            reader.recv_bytes(),
            Err(IpcError::FrameTooLarge { len: 9, max: 8 })
        ));
    }

    #[test]
    fn poll_times_out_without_data() {
        let (reader, _writer) = pipe(false, &Context::default()).unwrap();
        assert!(!reader.poll(Some(Duration::from_millis(20))).unwrap());
    }
}
