//! Byte encoding for everything that travels between ranks.
//!
//! Ranks in separate processes share no memory, so every value handed to a
//! collective must be able to flatten itself into a byte buffer and come back
//! out on the other side. Fixed-size plain data goes through `bytemuck`;
//! containers write a length prefix followed by their items.

use bytemuck::Pod;
use smallvec::{Array, SmallVec};

use crate::shared::{ParticleType, Vec3};

pub trait Payload: Send + Sized + 'static {
    fn encode(&self, buf: &mut Vec<u8>);

    /// Reads one value from the front of `buf` and advances past it.
    /// Returns `None` if the bytes run out or do not form a valid value.
    fn decode(buf: &mut &[u8]) -> Option<Self>;
}

pub fn encode_pod<T: Pod>(value: &T, buf: &mut Vec<u8>) {
    buf.extend_from_slice(bytemuck::bytes_of(value));
}

pub fn decode_pod<T: Pod>(buf: &mut &[u8]) -> Option<T> {
    let size = size_of::<T>();
    if buf.len() < size {
        return None;
    }
    let (head, tail) = buf.split_at(size);
    *buf = tail;
    Some(bytemuck::pod_read_unaligned(head))
}

/// Encodes `value` into a fresh buffer.
pub fn to_bytes<T: Payload>(value: &T) -> Vec<u8> {
    let mut buf = Vec::new();
    value.encode(&mut buf);
    buf
}

/// Decodes a value that must span all of `bytes`.
pub fn from_bytes<T: Payload>(mut bytes: &[u8]) -> Option<T> {
    let value = T::decode(&mut bytes)?;
    bytes.is_empty().then_some(value)
}

macro_rules! pod_payload {
    ($($t:ty),*) => {
        $(
            impl Payload for $t {
                fn encode(&self, buf: &mut Vec<u8>) {
                    encode_pod(self, buf);
                }

                fn decode(buf: &mut &[u8]) -> Option<Self> {
                    decode_pod(buf)
                }
            }
        )*
    };
}

pod_payload!(u8, u32, u64, i64, f64, Vec3);

// Fixed width, so ranks built for different targets still agree.
impl Payload for usize {
    fn encode(&self, buf: &mut Vec<u8>) {
        (*self as u64).encode(buf);
    }

    fn decode(buf: &mut &[u8]) -> Option<Self> {
        usize::try_from(u64::decode(buf)?).ok()
    }
}

impl Payload for bool {
    fn encode(&self, buf: &mut Vec<u8>) {
        u8::from(*self).encode(buf);
    }

    fn decode(buf: &mut &[u8]) -> Option<Self> {
        match u8::decode(buf)? {
            0 => Some(false),
            1 => Some(true),
            _ => None,
        }
    }
}

impl Payload for () {
    fn encode(&self, _buf: &mut Vec<u8>) {}

    fn decode(_buf: &mut &[u8]) -> Option<Self> {
        Some(())
    }
}

impl Payload for ParticleType {
    fn encode(&self, buf: &mut Vec<u8>) {
        (self.index() as u8).encode(buf);
    }

    fn decode(buf: &mut &[u8]) -> Option<Self> {
        ParticleType::from_index(u8::decode(buf)? as usize)
    }
}

impl<T: Payload> Payload for Option<T> {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.is_some().encode(buf);
        if let Some(value) = self {
            value.encode(buf);
        }
    }

    fn decode(buf: &mut &[u8]) -> Option<Self> {
        if bool::decode(buf)? {
            T::decode(buf).map(Some)
        } else {
            Some(None)
        }
    }
}

impl<A: Payload, B: Payload> Payload for (A, B) {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.0.encode(buf);
        self.1.encode(buf);
    }

    fn decode(buf: &mut &[u8]) -> Option<Self> {
        Some((A::decode(buf)?, B::decode(buf)?))
    }
}

fn decode_items<T: Payload, C: Extend<T> + Default>(buf: &mut &[u8]) -> Option<C> {
    let len = usize::decode(buf)?;
    let mut items = C::default();
    for _ in 0..len {
        items.extend(Some(T::decode(buf)?));
    }
    Some(items)
}

impl<T: Payload> Payload for Vec<T> {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.len().encode(buf);
        for item in self {
            item.encode(buf);
        }
    }

    fn decode(buf: &mut &[u8]) -> Option<Self> {
        decode_items::<T, _>(buf)
    }
}

impl<A> Payload for SmallVec<A>
where
    A: Array + 'static,
    A::Item: Payload,
{
    fn encode(&self, buf: &mut Vec<u8>) {
        self.len().encode(buf);
        for item in self {
            item.encode(buf);
        }
    }

    fn decode(buf: &mut &[u8]) -> Option<Self> {
        decode_items::<A::Item, _>(buf)
    }
}

#[cfg(test)]
mod tests {
    use smallvec::smallvec;

    use super::*;

    #[test]
    fn nested_containers_come_back_intact() {
        let list: SmallVec<[usize; 8]> = smallvec![3, 1, 4, 1, 5, 9, 2, 6, 5];
        let value: Vec<(usize, Option<(Vec3, SmallVec<[usize; 8]>)>)> = vec![
            (7, Some((Vec3::new(0.5, -1.0, 2.25), list))),
            (0, None),
        ];
        let bytes = to_bytes(&value);
        assert_eq!(from_bytes(&bytes), Some(value));
    }

    #[test]
    fn truncated_or_padded_messages_are_rejected() {
        let bytes = to_bytes(&vec![1.5f64, 2.5]);
        assert_eq!(from_bytes::<Vec<f64>>(&bytes[..bytes.len() - 1]), None);

        let mut padded = bytes.clone();
        padded.push(0);
        assert_eq!(from_bytes::<Vec<f64>>(&padded), None);
    }

    #[test]
    fn invalid_tags_are_rejected() {
        assert_eq!(from_bytes::<bool>(&[2]), None);
        assert_eq!(from_bytes::<ParticleType>(&[6]), None);
        assert_eq!(from_bytes::<ParticleType>(&[4]), Some(ParticleType::Star));
    }
}
