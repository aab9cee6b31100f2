//! Bounds-checked decoding of packed kernel records.
//!
//! Both inotify and rtnetlink hand back a buffer of back-to-back records,
//! each a fixed header followed by a variable tail whose length lives in the
//! header. A [`Record`] knows how to pull one record off the front of a
//! slice; [`Records`] walks a whole buffer and decides whether to resume or
//! give up after a bad one.

use std::marker::PhantomData;

use bytemuck::Pod;

use crate::protocol_common::{MalformedRecordSnafu, WatchError};

/// Why a single record could not be decoded, and where the next one starts
/// if that is still known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Malformed {
    pub reason: &'static str,
    /// Offset of the next record relative to the start of this one. `None`
    /// once the header itself can't be trusted.
    pub resume_at: Option<usize>,
}

impl Malformed {
    pub const fn fatal(reason: &'static str) -> Self {
        Self {
            reason,
            resume_at: None,
        }
    }

    pub const fn skip(reason: &'static str, resume_at: usize) -> Self {
        Self {
            reason,
            resume_at: Some(resume_at),
        }
    }
}

pub trait Record: Sized {
    /// Decode one record from the front of `buf`, returning it along with the
    /// number of bytes to advance. The advance may run past `buf.len()`
    /// (trailing padding the kernel omitted); it must never be zero.
    fn decode(buf: &[u8]) -> Result<(Self, usize), Malformed>;
}

/// Copy a `T` out of `buf` at `offset`. `None` if it would run past the end.
#[inline]
pub fn read_pod<T: Pod>(buf: &[u8], offset: usize) -> Option<T> {
    let end = offset.checked_add(size_of::<T>())?;
    bytemuck::try_pod_read_unaligned(buf.get(offset..end)?).ok()
}

pub struct Records<'a, R> {
    buf: &'a [u8],
    offset: usize,
    finished: bool,
    _record: PhantomData<R>,
}

pub fn records<R: Record>(buf: &[u8]) -> Records<'_, R> {
    Records {
        buf,
        offset: 0,
        finished: false,
        _record: PhantomData,
    }
}

impl<R: Record> Iterator for Records<'_, R> {
    type Item = Result<R, WatchError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished || self.offset >= self.buf.len() {
            return None;
        }

        let at = self.offset;
        match R::decode(&self.buf[at..]) {
            Ok((record, advance)) => {
                debug_assert!(advance > 0);
                self.offset = at.saturating_add(advance.max(1));
                Some(Ok(record))
            }
            Err(malformed) => {
                match malformed.resume_at {
                    Some(n) if n > 0 => self.offset = at.saturating_add(n),
                    // alignment is lost, abandon the rest of the buffer
                    _ => self.finished = true,
                }
                Some(
                    MalformedRecordSnafu {
                        offset: at,
                        reason: malformed.reason,
                    }
                    .fail(),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `[len:u8][len - 1 bytes]`, with len 0 unrecoverable and len 0xff
    /// rejected but skippable.
    #[derive(Debug, PartialEq, Eq)]
    struct Tlv(Vec<u8>);

    impl Record for Tlv {
        fn decode(buf: &[u8]) -> Result<(Self, usize), Malformed> {
            let len: u8 =
                read_pod(buf, 0).ok_or(Malformed::fatal("empty"))?;
            let len = usize::from(len);
            if len == 0 {
                return Err(Malformed::fatal("zero length"));
            }
            let body = buf.get(1..len).ok_or(Malformed::fatal("overrun"))?;
            if len == 0xff {
                return Err(Malformed::skip("reserved length", len));
            }
            Ok((Tlv(body.to_vec()), len))
        }
    }

    #[test]
    fn read_pod_refuses_to_overrun() {
        let buf = [1u8, 2, 3];
        assert_eq!(read_pod::<u16>(&buf, 1), Some(u16::from_ne_bytes([2, 3])));
        assert_eq!(read_pod::<u16>(&buf, 2), None);
        assert_eq!(read_pod::<u32>(&buf, 0), None);
        assert_eq!(read_pod::<u8>(&buf, usize::MAX), None);
    }

    #[test]
    fn walks_back_to_back_records() {
        let buf = [3u8, 0xaa, 0xbb, 2, 0xcc];
        let out: Vec<_> = records::<Tlv>(&buf).map(Result::unwrap).collect();
        assert_eq!(out, vec![Tlv(vec![0xaa, 0xbb]), Tlv(vec![0xcc])]);
    }

    #[test]
    fn stops_when_alignment_is_lost() {
        let buf = [2u8, 0x01, 0, 9, 9, 2, 0x02];
        let out: Vec<_> = records::<Tlv>(&buf).collect();
        assert_eq!(out.len(), 2);
        assert!(out[0].is_ok());
        match &out[1] {
            Err(WatchError::MalformedRecord { offset, reason, .. }) => {
                assert_eq!(*offset, 2);
                assert_eq!(*reason, "zero length");
            }
            other => panic!("expected MalformedRecord, got {other:?}"),
        }
    }

    #[test]
    fn length_past_end_is_not_followed() {
        let buf = [9u8, 1, 2];
        let out: Vec<_> = records::<Tlv>(&buf).collect();
        assert_eq!(out.len(), 1);
        assert!(out[0].as_ref().is_err_and(WatchError::is_malformed));
    }

    #[test]
    fn skippable_record_resumes_at_next_offset() {
        let mut buf = vec![0xffu8];
        buf.extend(std::iter::repeat_n(0u8, 0xfe));
        buf.extend([2, 0x42]);
        let out: Vec<_> = records::<Tlv>(&buf).collect();
        assert_eq!(out.len(), 2);
        assert!(out[0].is_err());
        assert_eq!(out[1].as_ref().ok(), Some(&Tlv(vec![0x42])));
    }
}
