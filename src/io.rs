//! Persisted layout of plaintexts and ciphertexts.
//!
//! ```text
//! magic "HEVL" | version u8 | kind u8 | scheme u8 | encoding u8 | level u32
//! | scale f64 (CKKS only) | size u32 (ciphertexts only) | blob_len u64 | blob
//! ```
//!
//! All integers little endian. The blob is the engine's own serialization.
//! A bare engine blob without header can still be loaded when the caller
//! supplies the tags.

use crate::cipher::Ciphertext;
use crate::context::Context;
use crate::engine::{Engine, NativeInfo};
use crate::error::{HeError, Result};
use crate::plain::Plaintext;
use crate::scheme::{EncodingTag, SchemeTag};
use crate::state::scales_close;
use crate::value::{OpaqueValue, ValueMeta};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{ErrorKind, Read};
use std::path::Path;
use tracing::debug;

/// First bytes of a headed blob.
pub const MAGIC: [u8; 4] = *b"HEVL";
/// Header layout version.
pub const VERSION: u8 = 1;

/// What a persisted blob holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueKind {
    /// A plaintext.
    Plain,
    /// A ciphertext.
    Cipher,
}

impl ValueKind {
    fn to_byte(self) -> u8 {
        match self {
            ValueKind::Plain => 0,
            ValueKind::Cipher => 1,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(ValueKind::Plain),
            1 => Some(ValueKind::Cipher),
            _ => None,
        }
    }
}

/// Tags supplied by the caller when loading.
///
/// Required for headerless blobs; with a header they must agree with it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tags {
    /// Scheme of the stored value.
    pub scheme: SchemeTag,
    /// Encoding of the stored value.
    pub encoding: EncodingTag,
}

#[derive(Clone, Debug, PartialEq)]
struct Header {
    kind: ValueKind,
    scheme: SchemeTag,
    encoding: EncodingTag,
    level: u32,
    scale: Option<f64>,
    size: u32,
    blob_len: u64,
}

fn mismatch(msg: impl Into<String>) -> HeError {
    HeError::HeaderMismatch(msg.into())
}

fn write_value(header: &Header, blob: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(32 + blob.len());
    out.extend_from_slice(&MAGIC);
    out.write_u8(VERSION)?;
    out.write_u8(header.kind.to_byte())?;
    out.write_u8(header.scheme.to_byte())?;
    out.write_u8(header.encoding.to_byte())?;
    out.write_u32::<LittleEndian>(header.level)?;
    if header.scheme == SchemeTag::Ckks {
        out.write_f64::<LittleEndian>(header.scale.unwrap_or(0.0))?;
    }
    if header.kind == ValueKind::Cipher {
        out.write_u32::<LittleEndian>(header.size)?;
    }
    out.write_u64::<LittleEndian>(header.blob_len)?;
    out.extend_from_slice(blob);
    Ok(out)
}

/// Split `bytes` into header and blob; `None` when there is no header.
fn read_header(bytes: &[u8]) -> Result<Option<(Header, &[u8])>> {
    if bytes.len() < MAGIC.len() || bytes[..MAGIC.len()] != MAGIC {
        return Ok(None);
    }
    let mut r = &bytes[MAGIC.len()..];
    let truncated = |e: std::io::Error| match e.kind() {
        ErrorKind::UnexpectedEof => mismatch("truncated header"),
        _ => HeError::Io(e),
    };
    let version = r.read_u8().map_err(truncated)?;
    if version != VERSION {
        return Err(mismatch(format!("unsupported layout version {}", version)));
    }
    let kind = ValueKind::from_byte(r.read_u8().map_err(truncated)?)
        .ok_or_else(|| mismatch("unknown value kind"))?;
    let scheme = SchemeTag::from_byte(r.read_u8().map_err(truncated)?)
        .ok_or_else(|| mismatch("unknown scheme"))?;
    let encoding = EncodingTag::from_byte(r.read_u8().map_err(truncated)?)
        .ok_or_else(|| mismatch("unknown encoding"))?;
    let level = r.read_u32::<LittleEndian>().map_err(truncated)?;
    let scale = match scheme {
        SchemeTag::Ckks => Some(r.read_f64::<LittleEndian>().map_err(truncated)?),
        _ => None,
    };
    let size = match kind {
        ValueKind::Cipher => r.read_u32::<LittleEndian>().map_err(truncated)?,
        ValueKind::Plain => 0,
    };
    let blob_len = r.read_u64::<LittleEndian>().map_err(truncated)?;
    if blob_len != r.len() as u64 {
        return Err(mismatch(format!("blob length {} but {} bytes follow", blob_len, r.len())));
    }
    let header = Header { kind, scheme, encoding, level, scale, size, blob_len };
    Ok(Some((header, r)))
}

/// Resolve the tags of a stored value and return them with its native blob.
fn resolve<'b, E: Engine>(
    ctx: &Context<E>,
    bytes: &'b [u8],
    kind: ValueKind,
    tags: Option<Tags>,
) -> Result<(Tags, Option<Header>, &'b [u8])> {
    let (tags, header, blob) = match (read_header(bytes)?, tags) {
        (Some((h, blob)), given) => {
            if h.kind != kind {
                return Err(mismatch(format!("stored {:?} value, {:?} requested", h.kind, kind)));
            }
            let stored = Tags { scheme: h.scheme, encoding: h.encoding };
            if let Some(given) = given {
                if given != stored {
                    return Err(mismatch(format!(
                        "header says {} {}, caller says {} {}",
                        stored.scheme, stored.encoding, given.scheme, given.encoding
                    )));
                }
            }
            (stored, Some(h), blob)
        }
        (None, Some(given)) => (given, None, bytes),
        (None, None) => return Err(mismatch("headerless blob and no tags supplied")),
    };
    if tags.scheme != ctx.scheme() {
        return Err(mismatch(format!("value is {}, context is {}", tags.scheme, ctx.scheme())));
    }
    if tags.encoding == EncodingTag::Undefined || !tags.scheme.allows(tags.encoding) {
        return Err(mismatch(format!("{} cannot carry {} values", tags.scheme, tags.encoding)));
    }
    Ok((tags, header, blob))
}

/// The engine's view of the handle must match what the header recorded.
fn check_native(header: Option<&Header>, native: &NativeInfo) -> Result<()> {
    let Some(h) = header else {
        return Ok(());
    };
    if h.level != native.level {
        return Err(mismatch(format!("header level {}, blob level {}", h.level, native.level)));
    }
    let scale_ok = match (h.scale, native.scale) {
        (Some(a), Some(b)) => scales_close(a, b, 1e-9),
        (None, None) => true,
        _ => false,
    };
    if !scale_ok {
        return Err(mismatch("header scale disagrees with blob"));
    }
    if h.kind == ValueKind::Cipher && h.size != native.size {
        return Err(mismatch(format!("header size {}, blob size {}", h.size, native.size)));
    }
    Ok(())
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    let mut file = std::fs::File::open(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => HeError::FileNotFound(path.to_path_buf()),
        _ => HeError::Io(e),
    })?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    Ok(bytes)
}

impl<'ctx, E: Engine> Plaintext<'ctx, E> {
    /// Header followed by the engine blob.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let blob = self.to_native_bytes()?;
        let header = Header {
            kind: ValueKind::Plain,
            scheme: self.scheme(),
            encoding: self.encoding(),
            level: self.chain_level(),
            scale: self.scale(),
            size: 0,
            blob_len: blob.len() as u64,
        };
        write_value(&header, &blob)
    }

    /// The engine blob alone.
    pub fn to_native_bytes(&self) -> Result<Vec<u8>> {
        let ctx = self.require("serialize")?;
        let handle = self.handle().ok_or(HeError::EmptyValue { op: "serialize" })?;
        ctx.engine().serialize_plain(handle)
    }

    /// Rebuild from [`Self::to_bytes`] output or a bare engine blob plus `tags`.
    pub fn from_bytes(ctx: &'ctx Context<E>, bytes: &[u8], tags: Option<Tags>) -> Result<Self> {
        let (tags, header, blob) = resolve(ctx, bytes, ValueKind::Plain, tags)?;
        let handle = ctx.engine().deserialize_plain(blob)?;
        let native = ctx.engine().plain_info(&handle);
        check_native(header.as_ref(), &native)?;
        let meta = ValueMeta::from_native(tags.scheme, tags.encoding, native)?;
        debug!(headerless = header.is_none(), "loaded plaintext {}", meta.info(0));
        Ok(Self::from_parts(ctx, meta, handle))
    }

    /// Write [`Self::to_bytes`] to `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    /// Read a file written by [`Self::save`] or by the engine.
    pub fn load(ctx: &'ctx Context<E>, path: impl AsRef<Path>, tags: Option<Tags>) -> Result<Self> {
        Self::from_bytes(ctx, &read_file(path.as_ref())?, tags)
    }
}

impl<'ctx, E: Engine> Ciphertext<'ctx, E> {
    /// Header followed by the engine blob.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let blob = self.to_native_bytes()?;
        let header = Header {
            kind: ValueKind::Cipher,
            scheme: self.scheme(),
            encoding: self.encoding(),
            level: self.chain_level(),
            scale: self.scale(),
            size: self.size(),
            blob_len: blob.len() as u64,
        };
        write_value(&header, &blob)
    }

    /// The engine blob alone.
    pub fn to_native_bytes(&self) -> Result<Vec<u8>> {
        let ctx = self.require("serialize")?;
        ctx.engine().serialize_cipher(self.handle_ref("serialize")?)
    }

    /// Rebuild from [`Self::to_bytes`] output or a bare engine blob plus `tags`.
    pub fn from_bytes(ctx: &'ctx Context<E>, bytes: &[u8], tags: Option<Tags>) -> Result<Self> {
        let (tags, header, blob) = resolve(ctx, bytes, ValueKind::Cipher, tags)?;
        let handle = ctx.engine().deserialize_cipher(blob)?;
        let native = ctx.engine().cipher_info(&handle);
        check_native(header.as_ref(), &native)?;
        let meta = ValueMeta::from_native(tags.scheme, tags.encoding, native)?;
        debug!(headerless = header.is_none(), "loaded ciphertext {}", meta.info(native.size));
        Ok(Self::from_parts(ctx, meta, native.size, handle))
    }

    /// Write [`Self::to_bytes`] to `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    /// Read a file written by [`Self::save`] or by the engine.
    pub fn load(ctx: &'ctx Context<E>, path: impl AsRef<Path>, tags: Option<Tags>) -> Result<Self> {
        Self::from_bytes(ctx, &read_file(path.as_ref())?, tags)
    }
}
