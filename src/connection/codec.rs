use std::fmt;
use std::io::{self, Read, Write};
use std::ops::{BitOr, BitOrAssign};

/// Per-message delivery hints. Only [`DataFlags::UPDATE`] is interpreted by
/// the transport; the remaining bits belong to the application.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct DataFlags(u16);

impl DataFlags {
    pub const NONE: DataFlags = DataFlags(0);
    /// Frequently refreshed, loss tolerant state. Eligible for the
    /// unreliable channel.
    pub const UPDATE: DataFlags = DataFlags(1 << 0);

    #[inline]
    pub const fn from_bits(bits: u16) -> Self {
        DataFlags(bits)
    }

    #[inline]
    pub const fn bits(self) -> u16 {
        self.0
    }

    #[inline]
    pub const fn contains(self, other: DataFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for DataFlags {
    type Output = DataFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        DataFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for DataFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for DataFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.contains(DataFlags::UPDATE) {
            write!(f, "DataFlags(UPDATE | {:#06x})", self.0 & !DataFlags::UPDATE.0)
        } else {
            write!(f, "DataFlags({:#06x})", self.0)
        }
    }
}

/// Anything the transport can carry.
pub trait NetMessage: Send + 'static {
    fn flags(&self) -> DataFlags;
}

/// Application message codec.
///
/// The transport never looks inside a message beyond [`NetMessage::flags`];
/// framing on the reliable stream is entirely the codec's business. On the
/// unreliable channel `read` is handed exactly one datagram.
pub trait Codec: Send + Sync + 'static {
    type Message: NetMessage;

    /// Encode `msg`, returning the number of bytes written.
    fn write(&self, out: &mut dyn Write, msg: &Self::Message) -> io::Result<usize>;

    fn read(&self, input: &mut dyn Read) -> io::Result<Self::Message>;

    /// Message emitted by keep-alive queues after a period of silence.
    fn keep_alive(&self) -> Option<Self::Message> {
        None
    }

    /// Received keep-alives are dropped by the readers instead of delivered.
    fn is_keep_alive(&self, _msg: &Self::Message) -> bool {
        false
    }
}

/// Opaque payload with delivery flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub flags: DataFlags,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(flags: DataFlags, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            flags,
            payload: payload.into(),
        }
    }

    pub fn reliable(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(DataFlags::NONE, payload)
    }

    pub fn update(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(DataFlags::UPDATE, payload)
    }

    /// Empty frames carry no application data.
    pub fn is_keep_alive(&self) -> bool {
        self.payload.is_empty()
    }
}

impl NetMessage for Frame {
    fn flags(&self) -> DataFlags {
        self.flags
    }
}

/// Length-prefixed [`Frame`] codec.
///
/// Layout: `u32` LE body length, `u16` LE flags, payload. The body length
/// counts the flags and the payload.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame: usize,
}

const FRAME_HEADER: usize = 4;
const FLAGS_LEN: usize = 2;

impl FrameCodec {
    pub fn new(max_frame: usize) -> Self {
        Self { max_frame }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(1 << 20)
    }
}

impl Codec for FrameCodec {
    type Message = Frame;

    fn write(&self, out: &mut dyn Write, msg: &Frame) -> io::Result<usize> {
        let body = FLAGS_LEN + msg.payload.len();
        if body > self.max_frame {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame of {body} bytes exceeds limit {}", self.max_frame),
            ));
        }
        out.write_all(&(body as u32).to_le_bytes())?;
        out.write_all(&msg.flags.bits().to_le_bytes())?;
        out.write_all(&msg.payload)?;
        Ok(FRAME_HEADER + body)
    }

    fn read(&self, input: &mut dyn Read) -> io::Result<Frame> {
        let mut header = [0u8; FRAME_HEADER];
        input.read_exact(&mut header)?;
        let body = u32::from_le_bytes(header) as usize;
        if !(FLAGS_LEN..=self.max_frame).contains(&body) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bad frame length {body}"),
            ));
        }

        let mut flags = [0u8; FLAGS_LEN];
        input.read_exact(&mut flags)?;
        let mut payload = vec![0u8; body - FLAGS_LEN];
        input.read_exact(&mut payload)?;

        Ok(Frame {
            flags: DataFlags::from_bits(u16::from_le_bytes(flags)),
            payload,
        })
    }

    fn keep_alive(&self) -> Option<Frame> {
        Some(Frame::update(Vec::new()))
    }

    fn is_keep_alive(&self, msg: &Frame) -> bool {
        msg.is_keep_alive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_contain() {
        let f = DataFlags::UPDATE | DataFlags::from_bits(0x10);
        assert!(f.contains(DataFlags::UPDATE));
        assert!(!DataFlags::NONE.contains(DataFlags::UPDATE));
        assert!(f.contains(DataFlags::NONE));
    }

    #[test]
    fn frames_stream_back_to_back() {
        let codec = FrameCodec::default();
        let mut wire = Vec::new();
        let n = codec.write(&mut wire, &Frame::update(b"pos".to_vec())).unwrap();
        codec.write(&mut wire, &Frame::reliable(b"chat".to_vec())).unwrap();
        assert_eq!(n, 4 + 2 + 3);

        let mut input = wire.as_slice();
        assert_eq!(codec.read(&mut input).unwrap(), Frame::update(b"pos".to_vec()));
        assert_eq!(codec.read(&mut input).unwrap(), Frame::reliable(b"chat".to_vec()));
        let eof = codec.read(&mut input).unwrap_err();
        assert_eq!(eof.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let codec = FrameCodec::new(8);
        let mut wire = Vec::new();
        assert!(codec.write(&mut wire, &Frame::reliable(vec![0u8; 16])).is_err());

        let bogus = 1_000u32.to_le_bytes();
        let err = codec.read(&mut bogus.as_slice()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
