// Copyright 2022 jmjoy
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

//! Name/value pair encoding used by `PARAMS` and `GET_VALUES_RESULT`
//! records (spec §4.3).
//!
//! Each pair is `(name-length, value-length, name, value)`. Each length is a
//! single byte if it is less than 128; otherwise it is a 4-byte big-endian
//! value with the high bit of the first byte set. Encoding always chooses
//! the tight form; decoding accepts either.

/// An encoded or decoded name length, tracking which wire form produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamLength {
    /// Values 0..127 encode as a single byte.
    Short(u8),
    /// Values >= 128 encode as 4 bytes with the top bit of the first set.
    Long(u32),
}

impl ParamLength {
    /// Picks the tight encoding for `len`.
    pub fn new(len: usize) -> Self {
        if len < 128 {
            ParamLength::Short(len as u8)
        } else {
            ParamLength::Long((len as u32) | (1 << 31))
        }
    }

    /// The decoded numeric length, regardless of wire form.
    pub fn value(self) -> usize {
        match self {
            ParamLength::Short(v) => v as usize,
            ParamLength::Long(v) => (v & !(1 << 31)) as usize,
        }
    }

    fn encode(self, out: &mut Vec<u8>) {
        match self {
            ParamLength::Short(v) => out.push(v),
            ParamLength::Long(v) => out.extend_from_slice(&v.to_be_bytes()),
        }
    }

    /// Decodes a length from the front of `buf`, returning the length and
    /// the number of bytes consumed. Returns `None` on truncated input.
    fn decode(buf: &[u8]) -> Option<(Self, usize)> {
        let first = *buf.first()?;
        if first & 0x80 == 0 {
            Some((ParamLength::Short(first), 1))
        } else {
            if buf.len() < 4 {
                return None;
            }
            let v = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
            Some((ParamLength::Long(v), 4))
        }
    }
}

/// Encodes `params` (in iteration order) into the tight FastCGI name/value
/// form, appending to `out`.
pub fn encode_params<'a, I>(out: &mut Vec<u8>, params: I)
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    for (name, value) in params {
        ParamLength::new(name.len()).encode(out);
        ParamLength::new(value.len()).encode(out);
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(value.as_bytes());
    }
}

/// Decodes a `PARAMS`/`GET_VALUES_RESULT` payload into owned name/value
/// pairs.
///
/// Decoding never splits a single parameter across the caller-supplied
/// buffer: if a parameter's header or body runs past the end of `buf`, this
/// returns an error rather than a partial pair. Callers (the demuxer) are
/// responsible for buffering until the full record is available before
/// calling this for `GET_VALUES_RESULT`, as spec §4.4 requires ("must
/// decode entire record atomically").
pub fn decode_params(mut buf: &[u8]) -> Result<Vec<(String, String)>, ParamsDecodeError> {
    let mut out = Vec::new();
    while !buf.is_empty() {
        let (name_len, consumed) =
            ParamLength::decode(buf).ok_or(ParamsDecodeError::Truncated)?;
        buf = &buf[consumed..];
        let (value_len, consumed) =
            ParamLength::decode(buf).ok_or(ParamsDecodeError::Truncated)?;
        buf = &buf[consumed..];

        let name_len = name_len.value();
        let value_len = value_len.value();
        if buf.len() < name_len + value_len {
            return Err(ParamsDecodeError::Truncated);
        }
        let name = std::str::from_utf8(&buf[..name_len])
            .map_err(|_| ParamsDecodeError::InvalidUtf8)?
            .to_owned();
        buf = &buf[name_len..];
        let value = std::str::from_utf8(&buf[..value_len])
            .map_err(|_| ParamsDecodeError::InvalidUtf8)?
            .to_owned();
        buf = &buf[value_len..];

        out.push((name, value));
    }
    Ok(out)
}

/// Failure decoding a name/value parameter list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParamsDecodeError {
    /// The payload ended in the middle of a length header or a name/value.
    #[error("truncated name/value parameter list")]
    Truncated,
    /// A name or value was not valid UTF-8.
    #[error("parameter name or value was not valid UTF-8")]
    InvalidUtf8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_form_round_trips() {
        let mut buf = Vec::new();
        encode_params(&mut buf, [("REQUEST_METHOD", "GET")]);
        let decoded = decode_params(&buf).unwrap();
        assert_eq!(decoded, vec![("REQUEST_METHOD".to_string(), "GET".to_string())]);
    }

    #[test]
    fn long_form_round_trips_for_large_value() {
        let big_value = "x".repeat(200);
        let mut buf = Vec::new();
        encode_params(&mut buf, [("BODY", big_value.as_str())]);
        // name length stays short-form, value length switches to long-form.
        assert_eq!(buf[0], "BODY".len() as u8);
        assert_eq!(buf[1] & 0x80, 0x80);
        let decoded = decode_params(&buf).unwrap();
        assert_eq!(decoded, vec![("BODY".to_string(), big_value)]);
    }

    #[test]
    fn long_form_name_and_value_both_round_trip() {
        let name = "N".repeat(150);
        let value = "V".repeat(150);
        let mut buf = Vec::new();
        encode_params(&mut buf, [(name.as_str(), value.as_str())]);
        let decoded = decode_params(&buf).unwrap();
        assert_eq!(decoded, vec![(name, value)]);
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let mut buf = Vec::new();
        encode_params(&mut buf, [("A", "B")]);
        buf.pop();
        assert_eq!(decode_params(&buf), Err(ParamsDecodeError::Truncated));
    }

    #[test]
    fn multiple_pairs_decode_in_order() {
        let mut buf = Vec::new();
        encode_params(&mut buf, [("A", "1"), ("B", "2"), ("C", "3")]);
        let decoded = decode_params(&buf).unwrap();
        assert_eq!(
            decoded,
            vec![
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "2".to_string()),
                ("C".to_string(), "3".to_string()),
            ]
        );
    }
}
