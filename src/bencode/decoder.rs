use super::BencodeError;
use super::BencodeResult;
use super::BencodeValue;

use std::collections::HashMap;
use std::io::{self, Read};
use tracing::instrument;

/// Buffered byte source with one-byte lookahead and a running count of
/// bytes consumed.
pub struct ByteReader<R: Read> {
    bytes: std::iter::Peekable<io::Bytes<R>>,
    consumed: usize,
}

impl<R: Read> ByteReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            bytes: reader.bytes().peekable(),
            consumed: 0,
        }
    }

    /// Total bytes consumed so far.
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    fn next(&mut self) -> BencodeResult<u8> {
        match self.bytes.next() {
            Some(Ok(b)) => {
                self.consumed += 1;
                Ok(b)
            }
            Some(Err(e)) => Err(BencodeError::Io(e)),
            None => Err(BencodeError::UnexpectedEof),
        }
    }

    fn peek(&mut self) -> BencodeResult<u8> {
        match self.bytes.peek() {
            Some(Ok(b)) => Ok(*b),
            Some(Err(e)) => Err(BencodeError::Io(e.kind().into())),
            None => Err(BencodeError::UnexpectedEof),
        }
    }
}

/// Decodes a single top-level bencode value from `reader`.
///
/// Returns the value together with the number of bytes consumed, so a
/// caller embedding bencode in a larger stream knows where it ended.
#[instrument(skip(reader), level = "debug")]
pub fn decode<R: Read>(reader: R) -> BencodeResult<(BencodeValue, usize)> {
    let mut reader = ByteReader::new(reader);
    let value = decode_value(&mut reader)?;
    Ok((value, reader.consumed()))
}

/// Reads an unsigned decimal run. The caller decides what terminates it;
/// at least one digit is required.
fn read_digits<R: Read>(reader: &mut ByteReader<R>) -> BencodeResult<String> {
    let mut digits = String::new();
    while reader.peek()?.is_ascii_digit() {
        digits.push(reader.next()? as char);
    }
    if digits.is_empty() {
        return Err(BencodeError::ExpectDigit);
    }
    Ok(digits)
}

/// Decodes a byte string of the form `<decimal-length>:<bytes>`.
#[instrument(skip(reader), level = "trace")]
pub fn decode_string<R: Read>(reader: &mut ByteReader<R>) -> BencodeResult<Vec<u8>> {
    let length = read_digits(reader)?
        .parse::<usize>()
        .map_err(|_| BencodeError::Invalid("string length overflow".to_string()))?;

    if reader.next()? != b':' {
        return Err(BencodeError::ExpectColon);
    }

    let mut bytes = vec![0u8; length];
    for slot in bytes.iter_mut() {
        *slot = reader.next()?;
    }
    Ok(bytes)
}

/// Decodes an integer of the form `i<signed-decimal>e`.
///
/// `-0`, a leading zero on anything but `0` itself, and an empty body are
/// all invalid.
#[instrument(skip(reader), level = "trace")]
pub fn decode_integer<R: Read>(reader: &mut ByteReader<R>) -> BencodeResult<i64> {
    if reader.next()? != b'i' {
        return Err(BencodeError::ExpectI);
    }

    let negative = reader.peek()? == b'-';
    if negative {
        reader.next()?;
    }

    let digits = read_digits(reader)?;
    if reader.next()? != b'e' {
        return Err(BencodeError::ExpectE);
    }

    if digits.len() > 1 && digits.starts_with('0') {
        return Err(BencodeError::Invalid("integer has leading zero".to_string()));
    }
    if negative && digits == "0" {
        return Err(BencodeError::Invalid("negative zero".to_string()));
    }

    let magnitude = if negative {
        format!("-{digits}")
    } else {
        digits
    };
    magnitude
        .parse::<i64>()
        .map_err(|_| BencodeError::Invalid("integer overflow".to_string()))
}

/// Decodes a list of the form `l<value>*e`.
#[instrument(skip(reader), level = "trace")]
fn decode_list<R: Read>(reader: &mut ByteReader<R>) -> BencodeResult<Vec<BencodeValue>> {
    if reader.next()? != b'l' {
        return Err(BencodeError::Invalid("list must start with 'l'".to_string()));
    }

    let mut list = Vec::new();
    while reader.peek()? != b'e' {
        list.push(decode_value(reader)?);
    }
    reader.next()?;
    Ok(list)
}

/// Decodes a dictionary of the form `d(<string><value>)*e`.
///
/// Out-of-order keys are tolerated (torrents with unsorted dicts exist
/// in the wild; the encoder canonicalises on re-emission), but a
/// duplicate key makes the value ambiguous and is rejected.
#[instrument(skip(reader), level = "trace")]
fn decode_dict<R: Read>(
    reader: &mut ByteReader<R>,
) -> BencodeResult<HashMap<Vec<u8>, BencodeValue>> {
    if reader.next()? != b'd' {
        return Err(BencodeError::Invalid(
            "dictionary must start with 'd'".to_string(),
        ));
    }

    let mut dict = HashMap::new();
    while reader.peek()? != b'e' {
        let key = decode_string(reader)?;
        let value = decode_value(reader)?;
        if dict.insert(key, value).is_some() {
            return Err(BencodeError::Invalid("duplicate dictionary key".to_string()));
        }
    }
    reader.next()?;
    Ok(dict)
}

fn decode_value<R: Read>(reader: &mut ByteReader<R>) -> BencodeResult<BencodeValue> {
    match reader.peek()? {
        b'0'..=b'9' => decode_string(reader).map(BencodeValue::String),
        b'i' => decode_integer(reader).map(BencodeValue::Integer),
        b'l' => decode_list(reader).map(BencodeValue::List),
        b'd' => decode_dict(reader).map(BencodeValue::Dict),
        other => Err(BencodeError::Invalid(format!(
            "unexpected byte 0x{other:02x}"
        ))),
    }
}
