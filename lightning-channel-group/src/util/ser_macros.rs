// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Helpers for writing and reading TLV streams.
//!
//! Fields are listed as `(type, field, required)` or `(type, field, option)`. Writers must list
//! types in increasing order, readers reject streams which do not.

#[doc(hidden)]
macro_rules! _encode_tlv {
	($stream: expr, $type: expr, $field: expr, required) => {
		BigSize($type).write($stream)?;
		BigSize($field.serialized_length() as u64).write($stream)?;
		$field.write($stream)?;
	};
	($stream: expr, $type: expr, $field: expr, option) => {
		if let Some(ref field) = $field {
			BigSize($type).write($stream)?;
			BigSize(field.serialized_length() as u64).write($stream)?;
			field.write($stream)?;
		}
	};
}

/// Writes out a TLV stream. Each field must implement [`Writeable`].
///
/// [`Writeable`]: crate::util::ser::Writeable
macro_rules! encode_tlv_stream {
	($stream: expr, {$(($type: expr, $field: expr, $fieldty: tt)),* $(,)*}) => { {
		#[allow(unused_imports)]
		use $crate::util::ser::{BigSize, Writeable};

		#[cfg(debug_assertions)]
		{
			#[allow(unused_mut, unused_assignments)]
			let mut last_seen: Option<u64> = None;
			$(
				if let Some(last) = last_seen {
					debug_assert!(last < $type, "TLV types must be written in increasing order");
				}
				last_seen = Some($type);
			)*
		}
		$(
			_encode_tlv!($stream, $type, $field, $fieldty);
		)*
	} }
}

#[doc(hidden)]
macro_rules! _decode_tlv {
	($reader: expr, $field: ident, required) => {
		$field = Some($crate::util::ser::Readable::read(&mut $reader)?);
	};
	($reader: expr, $field: ident, option) => {
		$field = Some($crate::util::ser::Readable::read(&mut $reader)?);
	};
}

#[doc(hidden)]
macro_rules! _check_decoded_tlv {
	($field: ident, required) => {
		if $field.is_none() {
			return Err($crate::msgs::DecodeError::InvalidValue);
		}
	};
	($field: ident, option) => {};
}

/// Reads a TLV stream into the given `Option` locals until the reader is exhausted.
///
/// Types must be strictly increasing. An unknown even type fails with
/// [`DecodeError::UnknownRequiredFeature`] while unknown odd types are skipped. A missing required
/// field, or a known record which is not consumed exactly, fails with
/// [`DecodeError::InvalidValue`].
///
/// [`DecodeError::UnknownRequiredFeature`]: crate::msgs::DecodeError::UnknownRequiredFeature
/// [`DecodeError::InvalidValue`]: crate::msgs::DecodeError::InvalidValue
macro_rules! decode_tlv_stream {
	($stream: expr, {$(($type: expr, $field: ident, $fieldty: tt)),* $(,)*}) => { {
		use $crate::msgs::DecodeError;
		use $crate::util::ser;

		let stream_ref = &mut *$stream;
		let mut last_seen_type: Option<u64> = None;
		'tlv_read: loop {
			// First decode the type of this TLV. Running out of data before reading any byte of
			// it simply marks the end of the stream.
			let typ: ser::BigSize = {
				let mut tracking_reader = ser::ReadTrackingReader::new(&mut *stream_ref);
				match <ser::BigSize as ser::Readable>::read(&mut tracking_reader) {
					Err(DecodeError::ShortRead) => {
						if !tracking_reader.have_read {
							break 'tlv_read;
						} else {
							return Err(DecodeError::ShortRead);
						}
					},
					Err(e) => return Err(e),
					Ok(t) => t,
				}
			};

			// Types must be unique and monotonically increasing:
			match last_seen_type {
				Some(t) if typ.0 <= t => return Err(DecodeError::InvalidValue),
				_ => {},
			}
			last_seen_type = Some(typ.0);

			// Finally, read the length and value itself:
			let length: ser::BigSize = ser::Readable::read(&mut *stream_ref)?;
			let mut s = ser::FixedLengthReader::new(&mut *stream_ref, length.0);
			match typ.0 {
				$(t if t == $type => {
					_decode_tlv!(s, $field, $fieldty);
					if s.bytes_remain() {
						// Return ShortRead if there's actually not enough bytes
						s.eat_remaining()?;
						return Err(DecodeError::InvalidValue);
					}
				},)*
				t if t % 2 == 0 => return Err(DecodeError::UnknownRequiredFeature),
				_ => {},
			}
			s.eat_remaining()?;
		}
		$(
			_check_decoded_tlv!($field, $fieldty);
		)*
	} }
}
