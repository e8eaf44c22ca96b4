// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! A very simple serialization framework which is used to serialize/deserialize the group
//! coordination messages.

use std::cmp;
use std::io::{self, Read, Write};

use bitcoin::consensus;
use bitcoin::hashes::Hash;
use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::PublicKey;
use bitcoin::{ScriptBuf, Transaction, Txid};

use crate::msgs::DecodeError;

/// The maximum length of a single script we are willing to read.
pub const MAX_SCRIPT_LEN: usize = 10_000;

/// The maximum number of elements we will pre-allocate for when reading a length-prefixed list.
const MAX_PREALLOC_ELEMENTS: u64 = 64;

/// A trait that is similar to std::io::Write but has one extra function which can be used to size
/// buffers being written into.
/// An impl is provided for any type that also impls std::io::Write which simply ignores size
/// hints.
pub trait Writer {
	/// Writes the given buf out. See std::io::Write::write_all for more
	fn write_all(&mut self, buf: &[u8]) -> Result<(), io::Error>;
}

impl<W: Write> Writer for W {
	#[inline]
	fn write_all(&mut self, buf: &[u8]) -> Result<(), io::Error> {
		<Self as Write>::write_all(self, buf)
	}
}

/// Writer that only tracks the amount of data written - useful if you need to calculate the length
/// of some data when serialized but don't yet need the full data.
pub(crate) struct LengthCalculatingWriter(pub usize);
impl Writer for LengthCalculatingWriter {
	#[inline]
	fn write_all(&mut self, buf: &[u8]) -> Result<(), io::Error> {
		self.0 += buf.len();
		Ok(())
	}
}

/// Essentially std::io::Take but a bit simpler and with a method to walk the underlying stream
/// forward to ensure we always consume exactly the fixed length specified.
pub(crate) struct FixedLengthReader<R: Read> {
	read: R,
	bytes_read: u64,
	total_bytes: u64,
}
impl<R: Read> FixedLengthReader<R> {
	pub fn new(read: R, total_bytes: u64) -> Self {
		Self { read, bytes_read: 0, total_bytes }
	}

	pub fn bytes_remain(&mut self) -> bool {
		self.bytes_read != self.total_bytes
	}

	pub fn eat_remaining(&mut self) -> Result<(), DecodeError> {
		io::copy(self, &mut io::sink())?;
		if self.bytes_read != self.total_bytes {
			Err(DecodeError::ShortRead)
		} else {
			Ok(())
		}
	}
}
impl<R: Read> Read for FixedLengthReader<R> {
	fn read(&mut self, dest: &mut [u8]) -> Result<usize, io::Error> {
		if self.total_bytes == self.bytes_read {
			Ok(0)
		} else {
			let read_len = cmp::min(dest.len() as u64, self.total_bytes - self.bytes_read);
			match self.read.read(&mut dest[0..(read_len as usize)]) {
				Ok(v) => {
					self.bytes_read += v as u64;
					Ok(v)
				},
				Err(e) => Err(e),
			}
		}
	}
}

/// A Read which tracks whether any bytes have been read at all. This allows us to distinguish
/// between "EOF reached before we started" and "EOF reached mid-read".
pub(crate) struct ReadTrackingReader<R: Read> {
	read: R,
	pub have_read: bool,
}
impl<R: Read> ReadTrackingReader<R> {
	pub fn new(read: R) -> Self {
		Self { read, have_read: false }
	}
}
impl<R: Read> Read for ReadTrackingReader<R> {
	fn read(&mut self, dest: &mut [u8]) -> Result<usize, io::Error> {
		match self.read.read(dest) {
			Ok(0) => Ok(0),
			Ok(len) => {
				self.have_read = true;
				Ok(len)
			},
			Err(e) => Err(e),
		}
	}
}

/// A trait that various types implement allowing them to be written out to a [`Writer`].
pub trait Writeable {
	/// Writes `self` out to the given [`Writer`].
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), io::Error>;

	/// Writes `self` out to a `Vec<u8>`.
	fn encode(&self) -> Vec<u8> {
		let mut msg = Vec::new();
		self.write(&mut msg).unwrap();
		msg
	}

	/// Gets the length of this object after it has been serialized. This can be overridden to
	/// optimize cases where we prepend an object with its length.
	#[inline]
	fn serialized_length(&self) -> usize {
		let mut len_calc = LengthCalculatingWriter(0);
		self.write(&mut len_calc).expect("No in-memory data may fail to serialize");
		len_calc.0
	}
}

impl<'a, T: Writeable> Writeable for &'a T {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), io::Error> {
		(*self).write(writer)
	}
}

/// A trait that various types implement allowing them to be read in from a [`Read`].
pub trait Readable
where
	Self: Sized,
{
	/// Reads a `Self` in from the given [`Read`].
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError>;
}

/// Lightning TLV uses a custom variable-length integer called `BigSize`. It is similar to Bitcoin's
/// variable-length integers except that it is serialized in big-endian instead of little-endian.
///
/// Like Bitcoin's variable-length integer, it exhibits ambiguity in that certain values can be
/// encoded in several different ways, which we must check for at deserialization-time. Every
/// numeric field in the group protocol is carried as a `BigSize`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BigSize(pub u64);
impl Writeable for BigSize {
	#[inline]
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), io::Error> {
		match self.0 {
			0..=0xFC => (self.0 as u8).write(writer),
			0xFD..=0xFFFF => {
				0xFDu8.write(writer)?;
				(self.0 as u16).write(writer)
			},
			0x10000..=0xFFFFFFFF => {
				0xFEu8.write(writer)?;
				(self.0 as u32).write(writer)
			},
			_ => {
				0xFFu8.write(writer)?;
				self.0.write(writer)
			},
		}
	}
}
impl Readable for BigSize {
	#[inline]
	fn read<R: Read>(reader: &mut R) -> Result<BigSize, DecodeError> {
		let n: u8 = Readable::read(reader)?;
		match n {
			0xFF => {
				let x: u64 = Readable::read(reader)?;
				if x < 0x100000000 {
					Err(DecodeError::InvalidValue)
				} else {
					Ok(BigSize(x))
				}
			},
			0xFE => {
				let x: u32 = Readable::read(reader)?;
				if x < 0x10000 {
					Err(DecodeError::InvalidValue)
				} else {
					Ok(BigSize(x as u64))
				}
			},
			0xFD => {
				let x: u16 = Readable::read(reader)?;
				if x < 0xFD {
					Err(DecodeError::InvalidValue)
				} else {
					Ok(BigSize(x as u64))
				}
			},
			n => Ok(BigSize(n as u64)),
		}
	}
}

/// A `BigSize` which must not exceed `MAX` when read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoundedBigSize<const MAX: u64>(pub u64);
impl<const MAX: u64> Writeable for BoundedBigSize<MAX> {
	#[inline]
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), io::Error> {
		BigSize(self.0).write(writer)
	}
}
impl<const MAX: u64> Readable for BoundedBigSize<MAX> {
	#[inline]
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
		let v: BigSize = Readable::read(reader)?;
		if v.0 > MAX {
			return Err(DecodeError::InvalidValue);
		}
		Ok(BoundedBigSize(v.0))
	}
}

macro_rules! impl_writeable_primitive {
	($val_type:ty, $len: expr) => {
		impl Writeable for $val_type {
			#[inline]
			fn write<W: Writer>(&self, writer: &mut W) -> Result<(), io::Error> {
				writer.write_all(&self.to_be_bytes())
			}
		}
		impl Readable for $val_type {
			#[inline]
			fn read<R: Read>(reader: &mut R) -> Result<$val_type, DecodeError> {
				let mut buf = [0; $len];
				reader.read_exact(&mut buf)?;
				Ok(<$val_type>::from_be_bytes(buf))
			}
		}
	};
}

impl_writeable_primitive!(u64, 8);
impl_writeable_primitive!(u32, 4);
impl_writeable_primitive!(u16, 2);

impl Writeable for u8 {
	#[inline]
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), io::Error> {
		writer.write_all(&[*self])
	}
}
impl Readable for u8 {
	#[inline]
	fn read<R: Read>(reader: &mut R) -> Result<u8, DecodeError> {
		let mut buf = [0; 1];
		reader.read_exact(&mut buf)?;
		Ok(buf[0])
	}
}

impl Writeable for [u8; 32] {
	#[inline]
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		w.write_all(self)
	}
}
impl Readable for [u8; 32] {
	#[inline]
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let mut buf = [0u8; 32];
		r.read_exact(&mut buf)?;
		Ok(buf)
	}
}

impl Writeable for PublicKey {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		self.serialize().write(w)
	}
}
impl Readable for PublicKey {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let mut buf = [0; 33];
		r.read_exact(&mut buf)?;
		match PublicKey::from_slice(&buf) {
			Ok(key) => Ok(key),
			Err(_) => return Err(DecodeError::InvalidValue),
		}
	}
}

impl Writeable for [u8; 33] {
	#[inline]
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		w.write_all(self)
	}
}

impl Writeable for Txid {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		w.write_all(&self[..])
	}
}
impl Readable for Txid {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let buf: [u8; 32] = Readable::read(r)?;
		Ok(Txid::from_byte_array(buf))
	}
}

/// Scripts are written with a `BigSize` length prefix and may not exceed [`MAX_SCRIPT_LEN`].
impl Writeable for ScriptBuf {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		BigSize(self.len() as u64).write(w)?;
		w.write_all(self.as_bytes())
	}
}
impl Readable for ScriptBuf {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let len: BigSize = Readable::read(r)?;
		if len.0 > MAX_SCRIPT_LEN as u64 {
			return Err(DecodeError::InvalidValue);
		}
		let mut buf = vec![0; len.0 as usize];
		r.read_exact(&mut buf)?;
		Ok(ScriptBuf::from(buf))
	}
}

/// A list prefixed by its `BigSize` element count.
impl<T: Writeable> Writeable for Vec<T> {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		BigSize(self.len() as u64).write(w)?;
		for elem in self.iter() {
			elem.write(w)?;
		}
		Ok(())
	}
}

/// A `BigSize`-count-prefixed list which may not contain more than `MAX` elements.
pub struct BoundedVec<T, const MAX: u64>(pub Vec<T>);
impl<T: Readable, const MAX: u64> Readable for BoundedVec<T, MAX> {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let count: BigSize = Readable::read(r)?;
		if count.0 > MAX {
			return Err(DecodeError::InvalidValue);
		}
		let mut ret = Vec::with_capacity(cmp::min(count.0, MAX_PREALLOC_ELEMENTS) as usize);
		for _ in 0..count.0 {
			ret.push(Readable::read(r)?);
		}
		Ok(BoundedVec(ret))
	}
}

/// For variable-length values within TLV record where the length is encoded as part of the record.
/// Used to prevent encoding the length twice.
pub struct WithoutLength<T>(pub T);

impl Writeable for WithoutLength<&String> {
	#[inline]
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		w.write_all(self.0.as_bytes())
	}
}
impl Readable for WithoutLength<String> {
	#[inline]
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let v: WithoutLength<Vec<u8>> = Readable::read(r)?;
		Ok(Self(String::from_utf8(v.0).map_err(|_| DecodeError::InvalidValue)?))
	}
}

impl Writeable for WithoutLength<&Vec<u8>> {
	#[inline]
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		w.write_all(self.0)
	}
}
impl Readable for WithoutLength<Vec<u8>> {
	#[inline]
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let mut buf = Vec::new();
		r.read_to_end(&mut buf)?;
		Ok(Self(buf))
	}
}

/// Transactions are consensus-encoded and fill the remainder of their TLV record.
impl Writeable for WithoutLength<&Transaction> {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		w.write_all(&consensus::encode::serialize(self.0))
	}
}
impl Readable for WithoutLength<Transaction> {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let buf: WithoutLength<Vec<u8>> = Readable::read(r)?;
		match consensus::encode::deserialize(&buf.0) {
			Ok(tx) => Ok(Self(tx)),
			Err(_) => Err(DecodeError::InvalidValue),
		}
	}
}

/// PSBTs use their BIP 174 binary encoding and fill the remainder of their TLV record.
impl Writeable for WithoutLength<&Psbt> {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		w.write_all(&self.0.serialize())
	}
}
impl Readable for WithoutLength<Psbt> {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let buf: WithoutLength<Vec<u8>> = Readable::read(r)?;
		match Psbt::deserialize(&buf.0) {
			Ok(psbt) => Ok(Self(psbt)),
			Err(_) => Err(DecodeError::InvalidValue),
		}
	}
}
