use anyhow::bail;
use bytes::{Buf, BufMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use bytes_varint::{VarIntSupport, VarIntSupportMut};

pub fn put_string(buf: &mut impl BufMut, s: &str) {
    buf.put_usize_varint(s.len());
    buf.put_slice(s.as_bytes());
}

pub fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let bytes = try_get_bytes(buf)?;
    Ok(String::from_utf8(bytes)?)
}

pub fn put_bytes(buf: &mut impl BufMut, bytes: &[u8]) {
    buf.put_usize_varint(bytes.len());
    buf.put_slice(bytes);
}

pub fn try_get_bytes(buf: &mut impl Buf) -> anyhow::Result<Vec<u8>> {
    let len = buf.try_get_usize_varint()?;
    if buf.remaining() < len {
        bail!("length prefix {} exceeds remaining buffer of {} bytes", len, buf.remaining());
    }
    let mut result = vec![0u8; len];
    buf.copy_to_slice(&mut result);
    Ok(result)
}

/// fallible counterpart of [bytes::Buf::get_u32_le]
pub fn try_get_u32_le(buf: &mut impl Buf) -> anyhow::Result<u32> {
    if buf.remaining() < 4 {
        bail!("short read: u32 expected, {} bytes available", buf.remaining());
    }
    Ok(buf.get_u32_le())
}

pub fn put_bool(buf: &mut impl BufMut, value: bool) {
    buf.put_u8(if value { 1 } else { 0 });
}

pub fn try_get_bool(buf: &mut impl Buf) -> anyhow::Result<bool> {
    match buf.try_get_u8()? {
        0 => Ok(false),
        1 => Ok(true),
        n => bail!("invalid bool discriminator: {}", n),
    }
}
