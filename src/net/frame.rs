use super::NetError;
use std::io::{Read, Write};

/// Upper bound on a single frame; a peer announcing more is treated as
/// corrupt rather than allocated for.
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// Writes one `u32`-length-prefixed frame.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), NetError> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(NetError::FrameTooLarge {
            observed: payload.len(),
            limit: MAX_FRAME_LEN,
        });
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Reads one frame. A clean EOF before the length prefix is `Closed`.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Vec<u8>, NetError> {
    let mut prefix = [0u8; 4];
    let mut filled = 0;
    while filled < prefix.len() {
        let read = reader.read(&mut prefix[filled..])?;
        if read == 0 {
            return Err(NetError::Closed);
        }
        filled += read;
    }
    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_FRAME_LEN {
        return Err(NetError::FrameTooLarge {
            observed: len,
            limit: MAX_FRAME_LEN,
        });
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frame_round_trip() {
        let mut buffer = Vec::new();
        write_frame(&mut buffer, b"hello scm").unwrap();
        write_frame(&mut buffer, b"").unwrap();
        let mut cursor = Cursor::new(buffer);
        assert_eq!(read_frame(&mut cursor).unwrap(), b"hello scm");
        assert_eq!(read_frame(&mut cursor).unwrap(), b"");
        assert!(matches!(read_frame(&mut cursor), Err(NetError::Closed)));
    }

    #[test]
    fn oversized_announcement_is_rejected() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&((MAX_FRAME_LEN + 1) as u32).to_be_bytes());
        let mut cursor = Cursor::new(buffer);
        assert!(matches!(
            read_frame(&mut cursor),
            Err(NetError::FrameTooLarge { .. })
        ));
    }
}
