// Wire codec for DPM list-protocol frames.
//
// A frame is a big-endian `u32` payload length followed by the payload. The
// payload starts with a one-byte message tag; every integer is big-endian.
// `encode_payload`/`decode_payload` are pure; `FrameCodec` plugs them into
// `tokio_util::codec::Framed`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;
use crate::message::{ListMode, Message, Setting, Value};
use crate::status::Status;

/// Largest accepted payload.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

const HEADER_LEN: usize = 4;

// ── Tags ────────────────────────────────────────────────────────────

const TAG_LIST_ADD: u8 = 0x01;
const TAG_LIST_START: u8 = 0x02;
const TAG_LIST_STOP: u8 = 0x03;
const TAG_LIST_CLEAR: u8 = 0x04;
const TAG_APPLY_SETTINGS: u8 = 0x05;
const TAG_AUTHENTICATE: u8 = 0x06;
const TAG_ENABLE_SETTINGS: u8 = 0x07;
const TAG_DATA_REPLY: u8 = 0x81;
const TAG_STATUS_REPLY: u8 = 0x82;
const TAG_AUTH_REPLY: u8 = 0x83;

const VALUE_NONE: u8 = 0;
const VALUE_SCALAR: u8 = 1;
const VALUE_ARRAY: u8 = 2;
const VALUE_TEXT: u8 = 3;
const VALUE_RAW: u8 = 4;

const MODE_IMMEDIATE: u8 = 0;
const MODE_CONTINUOUS: u8 = 1;

// ── Encoding ────────────────────────────────────────────────────────

/// Encode one message payload (without the length prefix).
pub fn encode_payload(msg: &Message, dst: &mut BytesMut) -> Result<(), Error> {
    match msg {
        Message::ListAdd { index, request } => {
            dst.put_u8(TAG_LIST_ADD);
            dst.put_u16(*index);
            put_str(dst, request)?;
        }
        Message::ListStart { mode } => {
            dst.put_u8(TAG_LIST_START);
            dst.put_u8(match mode {
                ListMode::Immediate => MODE_IMMEDIATE,
                ListMode::Continuous => MODE_CONTINUOUS,
            });
        }
        Message::ListStop => dst.put_u8(TAG_LIST_STOP),
        Message::ListClear => dst.put_u8(TAG_LIST_CLEAR),
        Message::ApplySettings { role, settings } => {
            dst.put_u8(TAG_APPLY_SETTINGS);
            match role {
                Some(role) => {
                    dst.put_u8(1);
                    put_str(dst, role)?;
                }
                None => dst.put_u8(0),
            }
            let count = u16::try_from(settings.len())
                .map_err(|_| Error::protocol(format!("too many settings: {}", settings.len())))?;
            dst.put_u16(count);
            for Setting { index, value } in settings {
                dst.put_u16(*index);
                put_value(dst, value)?;
            }
        }
        Message::Authenticate { token } => {
            dst.put_u8(TAG_AUTHENTICATE);
            put_blob(dst, token)?;
        }
        Message::EnableSettings { token } => {
            dst.put_u8(TAG_ENABLE_SETTINGS);
            put_blob(dst, token)?;
        }
        Message::DataReply {
            index,
            status,
            timestamp_ms,
            value,
        } => {
            dst.put_u8(TAG_DATA_REPLY);
            dst.put_u16(*index);
            dst.put_i16(status.code());
            dst.put_u64(*timestamp_ms);
            put_value(dst, value)?;
        }
        Message::StatusReply { index, status } => {
            dst.put_u8(TAG_STATUS_REPLY);
            dst.put_u16(*index);
            dst.put_i16(status.code());
        }
        Message::AuthReply { service, challenge } => {
            dst.put_u8(TAG_AUTH_REPLY);
            put_str(dst, service)?;
            put_blob(dst, challenge)?;
        }
    }
    Ok(())
}

fn put_str(dst: &mut BytesMut, s: &str) -> Result<(), Error> {
    let len = u16::try_from(s.len())
        .map_err(|_| Error::protocol(format!("string too long: {} bytes", s.len())))?;
    dst.put_u16(len);
    dst.put_slice(s.as_bytes());
    Ok(())
}

fn put_blob(dst: &mut BytesMut, b: &[u8]) -> Result<(), Error> {
    let len = u32::try_from(b.len())
        .map_err(|_| Error::protocol(format!("blob too long: {} bytes", b.len())))?;
    dst.put_u32(len);
    dst.put_slice(b);
    Ok(())
}

fn put_value(dst: &mut BytesMut, value: &Value) -> Result<(), Error> {
    match value {
        Value::None => dst.put_u8(VALUE_NONE),
        Value::Scalar(v) => {
            dst.put_u8(VALUE_SCALAR);
            dst.put_f64(*v);
        }
        Value::ScalarArray(vs) => {
            dst.put_u8(VALUE_ARRAY);
            let count = u32::try_from(vs.len())
                .map_err(|_| Error::protocol(format!("array too long: {}", vs.len())))?;
            dst.put_u32(count);
            for v in vs {
                dst.put_f64(*v);
            }
        }
        Value::Text(s) => {
            dst.put_u8(VALUE_TEXT);
            put_blob(dst, s.as_bytes())?;
        }
        Value::Raw(b) => {
            dst.put_u8(VALUE_RAW);
            put_blob(dst, b)?;
        }
    }
    Ok(())
}

// ── Decoding ────────────────────────────────────────────────────────

/// Decode one complete message payload (without the length prefix).
///
/// Unknown tags, truncated fields and trailing bytes are all rejected.
pub fn decode_payload(payload: Bytes) -> Result<Message, Error> {
    let mut r = Reader { buf: payload };
    let tag = r.u8("tag")?;
    let msg = match tag {
        TAG_LIST_ADD => Message::ListAdd {
            index: r.u16("index")?,
            request: r.str("request")?,
        },
        TAG_LIST_START => {
            let mode = match r.u8("mode")? {
                MODE_IMMEDIATE => ListMode::Immediate,
                MODE_CONTINUOUS => ListMode::Continuous,
                other => return Err(Error::protocol(format!("unknown list mode {other}"))),
            };
            Message::ListStart { mode }
        }
        TAG_LIST_STOP => Message::ListStop,
        TAG_LIST_CLEAR => Message::ListClear,
        TAG_APPLY_SETTINGS => {
            let role = r.opt_str("role")?;
            let count = r.u16("count")?;
            let mut settings = Vec::with_capacity(usize::from(count));
            for _ in 0..count {
                let index = r.u16("index")?;
                let value = r.value()?;
                settings.push(Setting { index, value });
            }
            Message::ApplySettings { role, settings }
        }
        TAG_AUTHENTICATE => Message::Authenticate {
            token: r.blob("token")?.to_vec(),
        },
        TAG_ENABLE_SETTINGS => Message::EnableSettings {
            token: r.blob("token")?.to_vec(),
        },
        TAG_DATA_REPLY => Message::DataReply {
            index: r.u16("index")?,
            status: Status::from_code(r.i16("status")?),
            timestamp_ms: r.u64("timestamp")?,
            value: r.value()?,
        },
        TAG_STATUS_REPLY => Message::StatusReply {
            index: r.u16("index")?,
            status: Status::from_code(r.i16("status")?),
        },
        TAG_AUTH_REPLY => Message::AuthReply {
            service: r.str("service")?,
            challenge: r.blob("challenge")?.to_vec(),
        },
        other => return Err(Error::protocol(format!("unknown message tag 0x{other:02x}"))),
    };
    r.finish(msg.name())?;
    Ok(msg)
}

/// Bounds-checked cursor over a payload.
struct Reader {
    buf: Bytes,
}

impl Reader {
    fn need(&self, n: usize, what: &str) -> Result<(), Error> {
        if self.buf.remaining() < n {
            return Err(Error::protocol(format!(
                "truncated {what}: need {n} bytes, have {}",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn u8(&mut self, what: &str) -> Result<u8, Error> {
        self.need(1, what)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self, what: &str) -> Result<u16, Error> {
        self.need(2, what)?;
        Ok(self.buf.get_u16())
    }

    fn i16(&mut self, what: &str) -> Result<i16, Error> {
        self.need(2, what)?;
        Ok(self.buf.get_i16())
    }

    fn u32(&mut self, what: &str) -> Result<u32, Error> {
        self.need(4, what)?;
        Ok(self.buf.get_u32())
    }

    fn u64(&mut self, what: &str) -> Result<u64, Error> {
        self.need(8, what)?;
        Ok(self.buf.get_u64())
    }

    fn f64(&mut self, what: &str) -> Result<f64, Error> {
        self.need(8, what)?;
        Ok(self.buf.get_f64())
    }

    fn bytes(&mut self, len: usize, what: &str) -> Result<Bytes, Error> {
        self.need(len, what)?;
        Ok(self.buf.split_to(len))
    }

    fn str(&mut self, what: &str) -> Result<String, Error> {
        let len = usize::from(self.u16(what)?);
        let raw = self.bytes(len, what)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| Error::protocol(format!("{what} is not valid UTF-8")))
    }

    fn opt_str(&mut self, what: &str) -> Result<Option<String>, Error> {
        match self.u8(what)? {
            0 => Ok(None),
            1 => self.str(what).map(Some),
            flag => Err(Error::protocol(format!("bad presence flag {flag} for {what}"))),
        }
    }

    fn blob(&mut self, what: &str) -> Result<Bytes, Error> {
        let len = to_usize(self.u32(what)?)?;
        self.bytes(len, what)
    }

    fn value(&mut self) -> Result<Value, Error> {
        match self.u8("value type")? {
            VALUE_NONE => Ok(Value::None),
            VALUE_SCALAR => Ok(Value::Scalar(self.f64("scalar")?)),
            VALUE_ARRAY => {
                let count = to_usize(self.u32("array length")?)?;
                // Reject impossible counts before allocating.
                self.need(count.saturating_mul(8), "array")?;
                let mut values = Vec::with_capacity(count);
                for _ in 0..count {
                    values.push(self.f64("array element")?);
                }
                Ok(Value::ScalarArray(values))
            }
            VALUE_TEXT => {
                let raw = self.blob("text")?;
                String::from_utf8(raw.to_vec())
                    .map(Value::Text)
                    .map_err(|_| Error::protocol("text value is not valid UTF-8"))
            }
            VALUE_RAW => Ok(Value::Raw(self.blob("raw")?.to_vec())),
            other => Err(Error::protocol(format!("unknown value type {other}"))),
        }
    }

    fn finish(&self, name: &str) -> Result<(), Error> {
        if self.buf.has_remaining() {
            return Err(Error::protocol(format!(
                "{} trailing bytes after {name}",
                self.buf.remaining()
            )));
        }
        Ok(())
    }
}

fn to_usize(n: u32) -> Result<usize, Error> {
    usize::try_from(n).map_err(|_| Error::protocol(format!("length {n} exceeds address space")))
}

// ── FrameCodec ──────────────────────────────────────────────────────

/// Length-prefixed framing for [`Message`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, Error> {
        let Some(header) = src.get(..HEADER_LEN) else {
            return Ok(None);
        };
        let mut len_bytes = [0u8; HEADER_LEN];
        len_bytes.copy_from_slice(header);
        let len = to_usize(u32::from_be_bytes(len_bytes))?;

        if len == 0 {
            return Err(Error::protocol("empty frame"));
        }
        if len > MAX_FRAME_LEN {
            return Err(Error::protocol(format!(
                "frame of {len} bytes exceeds limit of {MAX_FRAME_LEN}"
            )));
        }

        let total = HEADER_LEN + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();
        decode_payload(payload).map(Some)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Message>, Error> {
        match self.decode(src)? {
            Some(msg) => Ok(Some(msg)),
            None if src.is_empty() => Ok(None),
            None => Err(Error::protocol(format!(
                "connection closed mid-frame with {} bytes buffered",
                src.len()
            ))),
        }
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), Error> {
        let mut payload = BytesMut::new();
        encode_payload(&msg, &mut payload)?;
        if payload.len() > MAX_FRAME_LEN {
            return Err(Error::protocol(format!(
                "{} payload of {} bytes exceeds limit",
                msg.name(),
                payload.len()
            )));
        }
        let len = u32::try_from(payload.len())
            .map_err(|_| Error::protocol("payload length overflow"))?;
        dst.reserve(HEADER_LEN + payload.len());
        dst.put_u32(len);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}
