use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on one logical message, including command markers.
pub const MAX_FRAME_BYTES: usize = 1024;

/// Client-sent sentinel requesting a graceful disconnect.
pub const DISCONNECT_SENTINEL: &str = "!DISCONNECT";
/// Prefix of the presence snapshot pushed on every join/leave.
pub const USER_LIST_PREFIX: &str = "!USER_LIST";
/// First token of a whisper command.
pub const WHISPER_MARKER: &str = "/w";
/// First token of a direct-message command.
pub const DIRECT_MARKER: &str = "/dm";

/// Registration handshake replies.
pub const REGISTRATION_OK: &str = "Ok";
pub const REGISTRATION_TAKEN: &str = "Taken";

/// Reads the next non-empty line, with trailing line endings stripped.
///
/// Returns `Ok(None)` once the peer closes the connection. A frame longer
/// than [`MAX_FRAME_BYTES`] is a protocol violation and surfaces as an
/// `InvalidData` error, ending the session. The limit is enforced while the
/// bytes arrive, so a peer streaming data without a newline is cut off as
/// soon as the frame overflows rather than buffered without bound.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    // Simple line-oriented framing keeps interoperability with netcat-style tools.
    let mut frame: Vec<u8> = Vec::new();
    loop {
        let buffered = reader.fill_buf().await?;
        if buffered.is_empty() {
            // Peer closed; an unterminated trailing line still counts.
            return complete_frame(&mut frame);
        }

        if let Some(newline) = buffered.iter().position(|&byte| byte == b'\n') {
            frame.extend_from_slice(&buffered[..newline]);
            reader.consume(newline + 1);
            ensure_within_limit(frame.len())?;
            if let Some(line) = complete_frame(&mut frame)? {
                return Ok(Some(line));
            }
            // Blank line; keep reading.
        } else {
            frame.extend_from_slice(buffered);
            let taken = buffered.len();
            reader.consume(taken);
            ensure_within_limit(frame.len())?;
        }
    }
}

fn ensure_within_limit(len: usize) -> io::Result<()> {
    if len > MAX_FRAME_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds the {MAX_FRAME_BYTES}-byte limit"),
        ));
    }
    Ok(())
}

/// Trims trailing line endings and decodes the frame; `None` for a blank
/// line, which the caller skips.
fn complete_frame(frame: &mut Vec<u8>) -> io::Result<Option<String>> {
    while matches!(frame.last(), Some(b'\r' | b'\n')) {
        frame.pop();
    }
    if frame.is_empty() {
        return Ok(None);
    }
    String::from_utf8(std::mem::take(frame))
        .map(Some)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

/// Writes one line followed by a newline delimiter and flushes so peers get
/// timely updates.
pub async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

pub fn user_list(names: &[String]) -> String {
    format!("{USER_LIST_PREFIX}:{}", names.join(","))
}

pub fn broadcast_line(sender: &str, text: &str) -> String {
    format!("[{sender}]: {text}")
}

pub fn whisper_to_recipient(sender: &str, body: &str) -> String {
    format!("[Whisper from {sender}]: {body}")
}

pub fn whisper_echo(recipient: &str, body: &str) -> String {
    format!("[Whisper to {recipient}]: {body}")
}

pub fn direct_message(sender: &str, body: &str) -> String {
    format!("DM [{sender}]: {body}")
}

pub fn not_found(name: &str) -> String {
    format!("User {name} not found.")
}
