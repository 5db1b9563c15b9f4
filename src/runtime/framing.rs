//! Demultiplexer for the container engine's exec output stream
//!
//! The engine multiplexes stdout and stderr onto a single connection as
//! binary frames: an 8-byte header `[stream_type:1][reserved:3][length:4 BE]`
//! followed by `length` payload bytes. Network chunk boundaries carry no
//! relationship to frame boundaries, so the adapter accumulates raw bytes
//! and this parser walks the finished buffer frame by frame.

const HEADER_LEN: usize = 8;
const STREAM_STDOUT: u8 = 1;
const STREAM_STDERR: u8 = 2;

/// One demultiplexed frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

/// Parse every complete frame in `buf`.
///
/// A trailing incomplete frame (short header, or fewer payload bytes than
/// the header declares) ends parsing without an error: a forcibly
/// terminated stream routinely stops mid-frame and the complete prefix is
/// still valid output.
pub fn demux(buf: &[u8]) -> Vec<StreamFrame> {
    let mut frames = Vec::new();
    let mut offset = 0usize;

    while buf.len() - offset >= HEADER_LEN {
        let header = &buf[offset..offset + HEADER_LEN];
        let length = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;

        let start = offset + HEADER_LEN;
        let Some(end) = start.checked_add(length) else {
            break;
        };
        if end > buf.len() {
            // Incomplete payload
            break;
        }

        let payload = buf[start..end].to_vec();
        match header[0] {
            STREAM_STDOUT => frames.push(StreamFrame::Stdout(payload)),
            STREAM_STDERR => frames.push(StreamFrame::Stderr(payload)),
            // Stdin echo and unknown stream types are skipped over
            _ => {}
        }
        offset = end;
    }

    frames
}

/// Fold the frames in `buf` into decoded stdout and stderr text.
///
/// Payload bytes are accumulated per stream and decoded once at the end:
/// a multibyte character may be split across frame boundaries, so decoding
/// frame-by-frame would mangle it.
pub fn split_streams(buf: &[u8]) -> (String, String) {
    let mut stdout: Vec<u8> = Vec::new();
    let mut stderr: Vec<u8> = Vec::new();

    for frame in demux(buf) {
        match frame {
            StreamFrame::Stdout(bytes) => stdout.extend_from_slice(&bytes),
            StreamFrame::Stderr(bytes) => stderr.extend_from_slice(&bytes),
        }
    }

    (
        String::from_utf8_lossy(&stdout).into_owned(),
        String::from_utf8_lossy(&stderr).into_owned(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(stream_type: u8, payload: &[u8]) -> Vec<u8> {
        let mut bytes = vec![stream_type, 0, 0, 0];
        bytes.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn test_empty_buffer() {
        assert!(demux(&[]).is_empty());
    }

    #[test]
    fn test_single_stdout_frame() {
        let buf = frame(1, b"hello\n");
        assert_eq!(demux(&buf), vec![StreamFrame::Stdout(b"hello\n".to_vec())]);
    }

    #[test]
    fn test_interleaved_streams() {
        let mut buf = frame(1, b"out1");
        buf.extend(frame(2, b"err1"));
        buf.extend(frame(1, b"out2"));

        let (stdout, stderr) = split_streams(&buf);
        assert_eq!(stdout, "out1out2");
        assert_eq!(stderr, "err1");
    }

    #[test]
    fn test_truncated_header_dropped() {
        let mut buf = frame(1, b"complete");
        buf.extend_from_slice(&[2, 0, 0]); // 3 of 8 header bytes

        assert_eq!(demux(&buf), vec![StreamFrame::Stdout(b"complete".to_vec())]);
    }

    #[test]
    fn test_truncated_payload_dropped() {
        let mut buf = frame(1, b"complete");
        // Header declares 100 payload bytes, only 4 present
        buf.extend_from_slice(&[2, 0, 0, 0, 0, 0, 0, 100]);
        buf.extend_from_slice(b"oops");

        assert_eq!(demux(&buf), vec![StreamFrame::Stdout(b"complete".to_vec())]);
    }

    #[test]
    fn test_header_only_buffer() {
        assert!(demux(&[1, 0, 0, 0]).is_empty());
    }

    #[test]
    fn test_zero_length_payload() {
        let mut buf = frame(1, b"");
        buf.extend(frame(2, b"err"));

        assert_eq!(
            demux(&buf),
            vec![
                StreamFrame::Stdout(Vec::new()),
                StreamFrame::Stderr(b"err".to_vec())
            ]
        );
    }

    #[test]
    fn test_unknown_stream_type_skipped() {
        let mut buf = frame(0, b"stdin echo");
        buf.extend(frame(7, b"???"));
        buf.extend(frame(2, b"err"));

        assert_eq!(demux(&buf), vec![StreamFrame::Stderr(b"err".to_vec())]);
    }

    #[test]
    fn test_chunk_boundaries_do_not_matter() {
        // The same bytes parsed whole must equal any chunked accumulation
        let mut buf = frame(1, b"first chunk ");
        buf.extend(frame(1, b"second chunk"));

        let mut accumulated = Vec::new();
        for chunk in buf.chunks(3) {
            accumulated.extend_from_slice(chunk);
        }

        assert_eq!(demux(&accumulated), demux(&buf));
        let (stdout, _) = split_streams(&accumulated);
        assert_eq!(stdout, "first chunk second chunk");
    }

    #[test]
    fn test_multibyte_utf8_across_frames() {
        // A multibyte character split across two frames must decode intact
        let euro = "€".as_bytes();
        let mut buf = frame(1, &euro[..1]);
        buf.extend(frame(2, b"err"));
        buf.extend(frame(1, &euro[1..]));

        let (stdout, stderr) = split_streams(&buf);
        assert_eq!(stdout, "€");
        assert_eq!(stderr, "err");
    }
}
