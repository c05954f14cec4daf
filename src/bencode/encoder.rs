use super::BencodeResult;
use super::BencodeValue;
use std::collections::HashMap;
use std::io::Write;
use tracing::instrument;

fn encode_string<W: Write>(writer: &mut W, s: &[u8]) -> BencodeResult<usize> {
    let prefix = format!("{}:", s.len());
    writer.write_all(prefix.as_bytes())?;
    writer.write_all(s)?;
    Ok(prefix.len() + s.len())
}

fn encode_integer<W: Write>(writer: &mut W, i: i64) -> BencodeResult<usize> {
    let body = format!("i{i}e");
    writer.write_all(body.as_bytes())?;
    Ok(body.len())
}

fn encode_list<W: Write>(writer: &mut W, list: &[BencodeValue]) -> BencodeResult<usize> {
    writer.write_all(b"l")?;
    let mut written = 2;
    for item in list {
        written += encode_value(writer, item)?;
    }
    writer.write_all(b"e")?;
    Ok(written)
}

/// Dict keys are emitted sorted by raw byte comparison. The canonical
/// order is what makes the re-emitted info dict hash to the same
/// `info_hash` every other client computes.
fn encode_dict<W: Write>(
    writer: &mut W,
    dict: &HashMap<Vec<u8>, BencodeValue>,
) -> BencodeResult<usize> {
    writer.write_all(b"d")?;
    let mut written = 2;
    let mut keys: Vec<&Vec<u8>> = dict.keys().collect();
    keys.sort_unstable();
    for key in keys {
        written += encode_string(writer, key)?;
        written += encode_value(writer, &dict[key])?;
    }
    writer.write_all(b"e")?;
    Ok(written)
}

fn encode_value<W: Write>(writer: &mut W, value: &BencodeValue) -> BencodeResult<usize> {
    match value {
        BencodeValue::String(s) => encode_string(writer, s),
        BencodeValue::Integer(i) => encode_integer(writer, *i),
        BencodeValue::List(list) => encode_list(writer, list),
        BencodeValue::Dict(dict) => encode_dict(writer, dict),
    }
}

/// Encodes `value` into `writer`, returning the number of bytes written.
#[instrument(skip(writer, value), level = "debug")]
pub fn encode<W: Write>(writer: &mut W, value: &BencodeValue) -> BencodeResult<usize> {
    encode_value(writer, value)
}

/// Encodes `value` into a fresh buffer.
pub fn encode_to_vec(value: &BencodeValue) -> BencodeResult<Vec<u8>> {
    let mut buf = Vec::new();
    encode(&mut buf, value)?;
    Ok(buf)
}
