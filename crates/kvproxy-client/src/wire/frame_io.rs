// Length-capped frame reads and whole-frame writes on QUIC streams.
use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use kvproxy_wire::{Frame, FrameHeader, Message};
use quinn::{ReadExactError, RecvStream, SendStream};

/// Read one message; `Ok(None)` means the peer finished the stream cleanly.
pub(crate) async fn read_message(
    recv: &mut RecvStream,
    scratch: &mut BytesMut,
    max_frame_bytes: usize,
) -> Result<Option<Message>> {
    let frame = match read_frame_into(recv, scratch, max_frame_bytes).await? {
        Some(frame) => frame,
        None => return Ok(None),
    };
    match Message::decode(frame.clone()).context("decode message") {
        Ok(message) => Ok(Some(message)),
        Err(err) => {
            log_decode_error(&err, &frame);
            Err(err)
        }
    }
}

pub(crate) async fn read_frame_into(
    recv: &mut RecvStream,
    scratch: &mut BytesMut,
    max_frame_bytes: usize,
) -> Result<Option<Frame>> {
    let mut header_bytes = [0u8; FrameHeader::LEN];
    match recv.read_exact(&mut header_bytes).await {
        Ok(()) => {}
        Err(ReadExactError::FinishedEarly(0)) => return Ok(None),
        Err(ReadExactError::FinishedEarly(read)) => {
            return Err(anyhow::anyhow!(
                "stream finished inside a frame header ({read} bytes)"
            ));
        }
        Err(ReadExactError::ReadError(err)) => return Err(err.into()),
    }
    let header = FrameHeader::decode(Bytes::copy_from_slice(&header_bytes))
        .context("decode frame header")?;
    let length = usize::try_from(header.length).context("frame length")?;
    // Checked before allocating the payload buffer.
    if length > max_frame_bytes {
        return Err(anyhow::anyhow!(
            "frame too large: {length} bytes (cap {max_frame_bytes}); refusing"
        ));
    }
    scratch.clear();
    scratch.resize(length, 0u8);
    recv.read_exact(&mut scratch[..])
        .await
        .context("read frame payload")?;
    t_counter!("kvproxy_frames_in_total").increment(1);
    Ok(Some(Frame {
        header,
        payload: scratch.split().freeze(),
    }))
}

pub(crate) async fn write_message(send: &mut SendStream, message: &Message) -> Result<()> {
    let frame = message.encode().context("encode message")?;
    let mut header_bytes = [0u8; FrameHeader::LEN];
    frame.header.encode_into(&mut header_bytes);
    send.write_all(&header_bytes)
        .await
        .context("write frame header")?;
    send.write_all(&frame.payload)
        .await
        .context("write frame payload")?;
    t_counter!("kvproxy_frames_out_total").increment(1);
    Ok(())
}

fn log_decode_error(err: &anyhow::Error, frame: &Frame) {
    let preview_len = frame.payload.len().min(32);
    let preview_hex = frame.payload[..preview_len]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ");
    tracing::warn!(
        error = %err,
        flags = frame.header.flags,
        payload_len = frame.payload.len(),
        %preview_hex,
        "failed to decode gateway frame"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvproxy_wire::FrameHeader;

    #[test]
    fn decode_error_logging_handles_short_and_long_payloads() {
        let err = anyhow::anyhow!("bad frame");
        for payload in [Bytes::from_static(b"\x00\x01"), Bytes::from(vec![b'x'; 100])] {
            let frame = Frame {
                header: FrameHeader::new(0x80, payload.len() as u32),
                payload,
            };
            log_decode_error(&err, &frame);
        }
    }
}
