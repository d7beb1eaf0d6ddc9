// crates/core/src/codec.rs
//! Newline-delimited JSON framing for the agent's stdio stream.
//!
//! Each `\n`-terminated span is decoded on its own. A span that is not valid
//! JSON is logged and dropped; the spans after it decode normally.

use bytes::{BufMut, BytesMut};
use serde::Serialize;
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};

#[derive(Debug, Default)]
pub struct JsonLinesCodec {
    /// Bytes of `src` already searched for a newline.
    next_index: usize,
    dropped_frames: u64,
}

impl JsonLinesCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames discarded because they were not valid JSON.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }

    fn decode_span(&mut self, span: &[u8]) -> Option<Value> {
        let span = trim_line(span);
        if span.is_empty() {
            return None;
        }
        match serde_json::from_slice::<Value>(span) {
            Ok(value) => Some(value),
            Err(e) => {
                self.dropped_frames += 1;
                tracing::warn!(
                    error = %e,
                    len = span.len(),
                    preview = %String::from_utf8_lossy(&span[..span.len().min(120)]),
                    "dropping malformed JSON frame"
                );
                None
            }
        }
    }
}

fn trim_line(mut span: &[u8]) -> &[u8] {
    while let [rest @ .., b'\n' | b'\r'] = span {
        span = rest;
    }
    while let [b' ' | b'\t', rest @ ..] = span {
        span = rest;
    }
    span
}

impl Decoder for JsonLinesCodec {
    type Item = Value;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Value>, Self::Error> {
        loop {
            let Some(offset) = src[self.next_index..].iter().position(|b| *b == b'\n') else {
                self.next_index = src.len();
                return Ok(None);
            };
            let line = src.split_to(self.next_index + offset + 1);
            self.next_index = 0;
            if let Some(value) = self.decode_span(&line) {
                return Ok(Some(value));
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Value>, Self::Error> {
        if let Some(value) = self.decode(src)? {
            return Ok(Some(value));
        }
        // Unterminated final line: the writer exited mid-frame or without a
        // trailing newline. Try it once, then discard.
        if src.is_empty() {
            return Ok(None);
        }
        let rest = src.split();
        self.next_index = 0;
        Ok(self.decode_span(&rest))
    }
}

impl<T: Serialize> Encoder<T> for JsonLinesCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = serde_json::to_vec(&item)?;
        dst.reserve(line.len() + 1);
        dst.put_slice(&line);
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn encode_line(value: &Value) -> Vec<u8> {
        let mut dst = BytesMut::new();
        JsonLinesCodec::new().encode(value, &mut dst).unwrap();
        dst.to_vec()
    }

    fn decode_all(codec: &mut JsonLinesCodec, buf: &mut BytesMut) -> Vec<Value> {
        let mut out = Vec::new();
        while let Some(v) = codec.decode(buf).unwrap() {
            out.push(v);
        }
        out
    }

    #[test]
    fn test_multiple_frames_in_one_chunk() {
        let mut codec = JsonLinesCodec::new();
        let mut buf = BytesMut::from(&b"{\"type\":\"a\"}\n{\"type\":\"b\"}\n"[..]);
        let frames = decode_all(&mut codec, &mut buf);
        assert_eq!(frames, vec![json!({"type": "a"}), json!({"type": "b"})]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_frame_split_across_chunks() {
        let mut codec = JsonLinesCodec::new();
        let mut buf = BytesMut::from(&b"{\"type\":\"agent_"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"start\"}\n{\"ty");
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(json!({"type": "agent_start"}))
        );
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"pe\":\"agent_end\"}\n");
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(json!({"type": "agent_end"}))
        );
    }

    #[test]
    fn test_malformed_frame_is_isolated() {
        let mut codec = JsonLinesCodec::new();
        let mut buf = BytesMut::from(&b"{\"a\":1}\nnot json{\n\n{\"b\":2}\r\n"[..]);
        let frames = decode_all(&mut codec, &mut buf);
        assert_eq!(frames, vec![json!({"a": 1}), json!({"b": 2})]);
        assert_eq!(codec.dropped_frames(), 1);
    }

    #[test]
    fn test_decode_eof_unterminated_frame() {
        let mut codec = JsonLinesCodec::new();
        let mut buf = BytesMut::from(&b"{\"a\":1}\n{\"b\":2}"[..]);
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), Some(json!({"a": 1})));
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), Some(json!({"b": 2})));
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_encode_is_single_line() {
        let mut codec = JsonLinesCodec::new();
        let mut dst = BytesMut::new();
        codec
            .encode(json!({"type": "prompt", "message": "line1\nline2"}), &mut dst)
            .unwrap();
        let text = std::str::from_utf8(&dst).unwrap();
        assert!(text.ends_with('\n'));
        assert_eq!(text.matches('\n').count(), 1);
        assert_eq!(
            encode_line(&json!({"type": "abort"})),
            b"{\"type\":\"abort\"}\n".to_vec()
        );
    }

    fn frame_strategy() -> impl Strategy<Value = Value> {
        (any::<u32>(), ".{0,40}", proptest::bool::ANY).prop_map(|(n, s, flag)| {
            json!({"type": "message_update", "n": n, "text": s, "flag": flag, "nested": {"k": [n, s]}})
        })
    }

    proptest! {
        #[test]
        fn prop_any_chunking_yields_all_frames(
            frames in proptest::collection::vec(frame_strategy(), 1..12),
            cuts in proptest::collection::vec(any::<prop::sample::Index>(), 0..20),
        ) {
            let mut bytes = Vec::new();
            for frame in &frames {
                bytes.extend(encode_line(frame));
            }
            let mut points: Vec<usize> = cuts.iter().map(|i| i.index(bytes.len())).collect();
            points.push(bytes.len());
            points.sort_unstable();
            points.dedup();

            let mut codec = JsonLinesCodec::new();
            let mut buf = BytesMut::new();
            let mut decoded = Vec::new();
            let mut start = 0;
            for end in points {
                buf.extend_from_slice(&bytes[start..end]);
                start = end;
                decoded.extend(decode_all(&mut codec, &mut buf));
            }

            prop_assert_eq!(decoded.len(), frames.len());
            for (got, want) in decoded.iter().zip(&frames) {
                prop_assert_eq!(got.to_string(), want.to_string());
            }
        }
    }
}
