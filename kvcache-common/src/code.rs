// Copyright 2026 kvcache Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt::Debug;

use bytes::{Buf, BufMut, Bytes};
use paste::paste;

use crate::{
    error::{Error, Result},
    id::{TenantId, SYS_TENANT_ID},
};

/// Key type of the typed cache façade.
///
/// The core cache only stores bytes. A key is encoded once when it is inserted or looked up, and the encoded
/// bytes are what the index compares.
pub trait CacheKey: Sized + Send + Sync + 'static + Debug {
    /// Length of the encoded key.
    fn encoded_len(&self) -> usize;

    /// Encode the key into `buf`.
    ///
    /// `buf.len()` always equals [`CacheKey::encoded_len`].
    fn encode(&self, buf: &mut [u8]);

    /// Decode a key from the bytes produced by [`CacheKey::encode`].
    fn decode(buf: &[u8]) -> Result<Self>;

    /// The tenant that owns the key.
    fn tenant_id(&self) -> TenantId {
        SYS_TENANT_ID
    }

    /// Encode the key into a new buffer.
    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0; self.encoded_len()];
        self.encode(&mut buf);
        buf
    }
}

/// Value type of the typed cache façade.
pub trait CacheValue: Sized + Send + Sync + 'static + Debug {
    /// Length of the encoded value.
    fn encoded_len(&self) -> usize;

    /// Encode the value into `buf`.
    ///
    /// `buf.len()` always equals [`CacheValue::encoded_len`]. The buffer is the value range of an entry reserved
    /// inside a memory block, so encoding writes the value in place.
    fn encode(&self, buf: &mut [u8]);

    /// Decode a value from the bytes produced by [`CacheValue::encode`].
    fn decode(buf: &[u8]) -> Result<Self>;
}

macro_rules! for_all_primitives {
    ($macro:ident) => {
        $macro! {
            u8, u16, u32, u64, u128,
            i8, i16, i32, i64, i128,
        }
    };
}

macro_rules! impl_code_for_primitive {
    ($( $type:ty, )*) => {
        paste! {
            $(
                impl CacheKey for $type {
                    fn encoded_len(&self) -> usize {
                        std::mem::size_of::<$type>()
                    }

                    fn encode(&self, mut buf: &mut [u8]) {
                        buf.[< put_ $type >](*self)
                    }

                    fn decode(mut buf: &[u8]) -> Result<Self> {
                        check_len(std::mem::size_of::<$type>(), buf.len())?;
                        Ok(buf.[< get_ $type >]())
                    }
                }

                impl CacheValue for $type {
                    fn encoded_len(&self) -> usize {
                        std::mem::size_of::<$type>()
                    }

                    fn encode(&self, mut buf: &mut [u8]) {
                        buf.[< put_ $type >](*self)
                    }

                    fn decode(mut buf: &[u8]) -> Result<Self> {
                        check_len(std::mem::size_of::<$type>(), buf.len())?;
                        Ok(buf.[< get_ $type >]())
                    }
                }
            )*
        }
    };
}

for_all_primitives! { impl_code_for_primitive }

fn check_len(expected: usize, actual: usize) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(Error::decode("encoded length mismatch", expected, actual))
    }
}

macro_rules! impl_code_for_bytes {
    ($( $type:ty => |$buf:ident| $decode:expr, )*) => {
        $(
            impl CacheKey for $type {
                fn encoded_len(&self) -> usize {
                    self.len()
                }

                fn encode(&self, buf: &mut [u8]) {
                    buf.copy_from_slice(self.as_ref());
                }

                fn decode($buf: &[u8]) -> Result<Self> {
                    $decode
                }
            }

            impl CacheValue for $type {
                fn encoded_len(&self) -> usize {
                    self.len()
                }

                fn encode(&self, buf: &mut [u8]) {
                    buf.copy_from_slice(self.as_ref());
                }

                fn decode($buf: &[u8]) -> Result<Self> {
                    $decode
                }
            }
        )*
    };
}

impl_code_for_bytes! {
    Vec<u8> => |buf| Ok(buf.to_vec()),
    Bytes => |buf| Ok(Bytes::copy_from_slice(buf)),
    String => |buf| String::from_utf8(buf.to_vec())
        .map_err(|e| Error::new(crate::error::ErrorKind::Decode, "invalid utf-8 string").with_source(e)),
}

/// A key scoped to an explicit tenant.
///
/// The tenant id is encoded in front of the inner key, so the same inner key from two tenants never collides
/// in the index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TenantKey<K> {
    /// Owner tenant.
    pub tenant_id: TenantId,
    /// Inner key.
    pub key: K,
}

impl<K> TenantKey<K> {
    /// Create a tenant scoped key.
    pub fn new(tenant_id: TenantId, key: K) -> Self {
        Self { tenant_id, key }
    }
}

const TENANT_ID_LEN: usize = std::mem::size_of::<TenantId>();

impl<K> CacheKey for TenantKey<K>
where
    K: CacheKey,
{
    fn encoded_len(&self) -> usize {
        TENANT_ID_LEN + self.key.encoded_len()
    }

    fn encode(&self, buf: &mut [u8]) {
        let (mut head, tail) = buf.split_at_mut(TENANT_ID_LEN);
        head.put_u64(self.tenant_id);
        self.key.encode(tail);
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < TENANT_ID_LEN {
            return Err(Error::decode("tenant key too short", TENANT_ID_LEN, buf.len()));
        }
        let (mut head, tail) = buf.split_at(TENANT_ID_LEN);
        let tenant_id = head.get_u64();
        let key = K::decode(tail)?;
        Ok(Self { tenant_id, key })
    }

    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_primitive_code() {
        let v = 0x1234_5678_u32;
        let buf = CacheKey::to_bytes(&v);
        assert_eq!(buf, vec![0x12, 0x34, 0x56, 0x78]);
        assert_eq!(<u32 as CacheKey>::decode(&buf).unwrap(), v);

        let err = <u64 as CacheValue>::decode(&buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Decode);
    }

    #[test]
    fn test_string_code() {
        let key = "t1:100".to_string();
        assert_eq!(key.to_bytes(), b"t1:100".to_vec());
        assert_eq!(<String as CacheKey>::decode(b"t1:100").unwrap(), key);
        assert_eq!(
            <String as CacheValue>::decode(&[0xff, 0xfe]).unwrap_err().kind(),
            ErrorKind::Decode
        );
    }

    #[test]
    fn test_tenant_key() {
        let key = TenantKey::new(1002, "t1:100".to_string());
        assert_eq!(key.tenant_id(), 1002);
        assert_eq!("t1:100".to_string().tenant_id(), SYS_TENANT_ID);

        let buf = key.to_bytes();
        assert_eq!(buf.len(), 8 + 6);
        assert_eq!(TenantKey::<String>::decode(&buf).unwrap(), key);
        assert_ne!(TenantKey::new(1001, "t1:100".to_string()).to_bytes(), buf);
    }
}
