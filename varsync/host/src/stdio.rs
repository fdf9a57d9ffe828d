//! Length-prefixed frames: a 4-byte big-endian length followed by a UTF-8
//! JSON batch.

use std::io::{self, Read, Write};
use std::sync::mpsc::Receiver;

use varsync_runtime::{Batch, CodecError, decode_batch, encode_batch};

pub fn writer_loop(
    rx: Receiver<Batch>,
    mut writer: impl Write,
    max_payload: usize,
) -> Result<(), CodecError> {
    for batch in rx {
        let payload = encode_batch(&batch)?;
        match write_frame(&mut writer, &payload, max_payload) {
            Ok(()) => writer.flush()?,
            Err(CodecError::FrameTooLarge { len, max }) => {
                tracing::warn!(len, max, "outgoing batch dropped");
            }
            Err(err) => return Err(err),
        }
    }

    Ok(())
}

/// Reads frames until EOF, handing each decoded batch (or why it could not
/// be decoded) to `on_batch`. An oversized frame is skipped so the stream
/// stays aligned.
pub fn reader_loop<F>(
    mut reader: impl Read,
    max_payload: usize,
    mut on_batch: F,
) -> Result<(), CodecError>
where
    F: FnMut(Result<Batch, CodecError>),
{
    loop {
        match read_frame(&mut reader, max_payload) {
            Ok(payload) => on_batch(decode_batch(&payload)),
            Err(CodecError::FrameTooLarge { len, max }) => {
                io::copy(&mut (&mut reader).take(len as u64), &mut io::sink())?;
                on_batch(Err(CodecError::FrameTooLarge { len, max }));
            }
            Err(CodecError::Io(err)) if err.kind() == io::ErrorKind::UnexpectedEof => {
                return Ok(());
            }
            Err(err) => return Err(err),
        }
    }
}

pub fn read_frame(reader: &mut impl Read, max_payload: usize) -> Result<Vec<u8>, CodecError> {
    let mut len_buf = [0_u8; 4];
    reader.read_exact(&mut len_buf)?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_payload {
        return Err(CodecError::FrameTooLarge {
            len,
            max: max_payload,
        });
    }

    let mut payload = vec![0_u8; len];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

pub fn write_frame(
    writer: &mut impl Write,
    payload: &[u8],
    max_payload: usize,
) -> Result<(), CodecError> {
    let too_large = CodecError::FrameTooLarge {
        len: payload.len(),
        max: max_payload,
    };
    if payload.len() > max_payload {
        return Err(too_large);
    }
    let len = u32::try_from(payload.len()).map_err(|_| too_large)?;

    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)?;
    Ok(())
}
