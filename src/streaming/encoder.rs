//! Record encoders for the three body formats.
//!
//! Wire format per response body:
//!
//! | format  | prefix | separator | record                    | suffix |
//! |---------|--------|-----------|---------------------------|--------|
//! | json    | `[`    | `,`       | JSON object               | `]`    |
//! | ndjson  |        |           | JSON object + `\n`        |        |
//! | msgpack |        |           | MessagePack map (named)   |        |
//!
//! MessagePack values carry their own type and length, so a msgpack body is
//! just the values back to back.

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Cursor;

use crate::streaming::format::StreamFormat;

/// Boxed cause of a failed record encoding.
pub type EncodeError = Box<dyn std::error::Error + Send + Sync>;

/// Encoder for one response. Chosen once from the negotiated format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoder {
    ArrayJson,
    Ndjson,
    BinaryPack,
}

impl Encoder {
    pub fn for_format(format: StreamFormat) -> Self {
        match format {
            StreamFormat::ArrayJson => Encoder::ArrayJson,
            StreamFormat::Ndjson => Encoder::Ndjson,
            StreamFormat::BinaryPack => Encoder::BinaryPack,
        }
    }

    pub fn format(&self) -> StreamFormat {
        match self {
            Encoder::ArrayJson => StreamFormat::ArrayJson,
            Encoder::Ndjson => StreamFormat::Ndjson,
            Encoder::BinaryPack => StreamFormat::BinaryPack,
        }
    }

    /// Bytes written once before the first record.
    pub fn prefix(&self) -> &'static [u8] {
        match self {
            Encoder::ArrayJson => b"[",
            Encoder::Ndjson | Encoder::BinaryPack => b"",
        }
    }

    /// Bytes written before every record except the first.
    pub fn separator(&self) -> &'static [u8] {
        match self {
            Encoder::ArrayJson => b",",
            Encoder::Ndjson | Encoder::BinaryPack => b"",
        }
    }

    /// Bytes written once after the last record, also for an empty body.
    pub fn suffix(&self) -> &'static [u8] {
        match self {
            Encoder::ArrayJson => b"]",
            Encoder::Ndjson | Encoder::BinaryPack => b"",
        }
    }

    /// Append one record's encoding to `buf`.
    ///
    /// On failure `buf` is restored to its length before the call, so no
    /// partial record is left behind for the caller to send.
    pub fn encode<T>(&self, record: &T, buf: &mut BytesMut) -> Result<(), EncodeError>
    where
        T: Serialize + ?Sized,
    {
        let start = buf.len();
        let result = self.encode_unchecked(record, buf);
        if result.is_err() {
            buf.truncate(start);
        }
        result
    }

    fn encode_unchecked<T>(&self, record: &T, buf: &mut BytesMut) -> Result<(), EncodeError>
    where
        T: Serialize + ?Sized,
    {
        let mut writer = buf.writer();
        match self {
            Encoder::ArrayJson => serde_json::to_writer(&mut writer, record)?,
            Encoder::Ndjson => {
                serde_json::to_writer(&mut writer, record)?;
                writer.get_mut().put_u8(b'\n');
            }
            Encoder::BinaryPack => rmp_serde::encode::write_named(&mut writer, record)?,
        }
        Ok(())
    }

    /// Encode a single record on its own, without framing.
    pub fn encode_to_bytes<T>(&self, record: &T) -> Result<Bytes, EncodeError>
    where
        T: Serialize + ?Sized,
    {
        let mut buf = BytesMut::with_capacity(128);
        self.encode(record, &mut buf)?;
        Ok(buf.freeze())
    }
}

impl From<StreamFormat> for Encoder {
    fn from(format: StreamFormat) -> Self {
        Encoder::for_format(format)
    }
}

/// Decode a msgpack body back into records by reading one value at a time
/// until the input is exhausted.
pub fn decode_binary_pack<T: DeserializeOwned>(
    body: &[u8],
) -> Result<Vec<T>, rmp_serde::decode::Error> {
    let mut cursor = Cursor::new(body);
    let mut records = Vec::new();
    while (cursor.position() as usize) < body.len() {
        records.push(rmp_serde::from_read(&mut cursor)?);
    }
    Ok(records)
}
