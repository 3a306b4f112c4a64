//! Streaming codec for the command envelope, for use with `Framed`.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::command::{find_header_end, Envelope};

/// Refuse frames larger than this; a peer or client sending more is broken.
const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Default)]
pub struct EnvelopeCodec;

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>, Self::Error> {
        let Some(split) = find_header_end(src) else {
            if src.len() > MAX_FRAME_BYTES {
                anyhow::bail!("frame header exceeds {MAX_FRAME_BYTES} bytes");
            }
            return Ok(None);
        };
        // Peek at Content-Length before committing to consume the frame.
        let head = std::str::from_utf8(&src[..split])?;
        let content_length = head
            .split("\r\n")
            .skip(1)
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.trim().eq_ignore_ascii_case("Content-Length"))
            .map(|(_, value)| value.trim().parse::<usize>())
            .transpose()?
            .unwrap_or(0);
        if content_length > MAX_FRAME_BYTES {
            anyhow::bail!("frame body exceeds {MAX_FRAME_BYTES} bytes");
        }
        let total = split + 4 + content_length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        let frame = src.split_to(total);
        let envelope = Envelope::parse(&frame)?;
        src.reserve(64);
        Ok(Some(envelope))
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = anyhow::Error;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.put_slice(&item.serialize());
        Ok(())
    }
}
