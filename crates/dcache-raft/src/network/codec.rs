use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Largest frame accepted on the wire
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),
}

/// Length-prefixed bincode framing
///
/// Frame format: [4-byte length (big-endian)] [bincode payload]
///
/// `D` is the type decoded from the stream; any serializable value can be encoded.
pub struct RaftCodec<D> {
    max_frame: usize,
    _decode: PhantomData<fn() -> D>,
}

impl<D> RaftCodec<D> {
    pub fn new() -> Self {
        Self::with_max_frame(MAX_FRAME_SIZE)
    }

    pub fn with_max_frame(max_frame: usize) -> Self {
        Self {
            max_frame,
            _decode: PhantomData,
        }
    }
}

impl<D> Default for RaftCodec<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: DeserializeOwned> Decoder for RaftCodec<D> {
    type Item = D;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<D>, CodecError> {
        if src.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[0..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > self.max_frame {
            return Err(CodecError::FrameTooLarge(length));
        }

        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        src.advance(4);
        let payload = src.split_to(length);
        Ok(Some(bincode::deserialize(&payload)?))
    }
}

impl<D, E: Serialize> Encoder<E> for RaftCodec<D> {
    type Error = CodecError;

    fn encode(&mut self, item: E, dst: &mut BytesMut) -> Result<(), CodecError> {
        let payload = bincode::serialize(&item)?;
        if payload.len() > self.max_frame {
            return Err(CodecError::FrameTooLarge(payload.len()));
        }

        dst.reserve(4 + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{RaftRequest, RequestVoteRequest};

    fn vote() -> RaftRequest {
        RaftRequest::RequestVote(RequestVoteRequest {
            term: 7,
            candidate_id: "node2".into(),
            last_log_index: 12,
            last_log_term: 6,
        })
    }

    #[test]
    fn test_partial_frame_waits_for_more() {
        let mut codec = RaftCodec::<RaftRequest>::new();
        let mut full = BytesMut::new();
        codec.encode(vote(), &mut full).unwrap();

        let mut partial = BytesMut::from(&full[..full.len() - 3]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full[full.len() - 3..]);
        match codec.decode(&mut partial).unwrap() {
            Some(RaftRequest::RequestVote(req)) => {
                assert_eq!(req.term, 7);
                assert_eq!(req.candidate_id, "node2");
            }
            other => panic!("unexpected frame: {:?}", other),
        }
        assert!(partial.is_empty());
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let mut codec = RaftCodec::<RaftRequest>::new();
        let mut buf = BytesMut::new();
        codec.encode(vote(), &mut buf).unwrap();
        codec.encode(vote(), &mut buf).unwrap();

        assert!(codec.decode(&mut buf).unwrap().is_some());
        assert!(codec.decode(&mut buf).unwrap().is_some());
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = RaftCodec::<RaftRequest>::with_max_frame(8);
        let mut buf = BytesMut::new();
        buf.put_u32(1024);
        buf.put_slice(&[0u8; 16]);
        assert!(matches!(codec.decode(&mut buf), Err(CodecError::FrameTooLarge(1024))));

        let mut out = BytesMut::new();
        assert!(codec.encode(vote(), &mut out).is_err());
    }
}
