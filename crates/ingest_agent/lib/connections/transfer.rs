use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use ledger_core::{ConfigParams, ConnectionDefinition};

use crate::error::LedgerError;

/// Version tag written at the head of every export stream.
pub const EXPORT_FORMAT_VERSION: u32 = 1;

/// Writes `definitions` as a versioned big-endian stream.
pub fn write_definitions<W: Write>(
    writer: &mut W,
    definitions: &[ConnectionDefinition],
) -> Result<(), LedgerError> {
    let count = u32::try_from(definitions.len())
        .map_err(|_| LedgerError::Configuration("too many connections to export".to_string()))?;
    writer.write_u32::<BigEndian>(EXPORT_FORMAT_VERSION)?;
    writer.write_u32::<BigEndian>(count)?;
    for definition in definitions {
        write_string(writer, &definition.name)?;
        write_string(writer, &definition.description)?;
        write_string(writer, &definition.class_name)?;
        write_string(writer, &definition.config.to_document())?;
        writer.write_i32::<BigEndian>(definition.max_connections)?;
    }
    Ok(())
}

pub fn read_definitions<R: Read>(reader: &mut R) -> Result<Vec<ConnectionDefinition>, LedgerError> {
    let version = reader.read_u32::<BigEndian>()?;
    if version != EXPORT_FORMAT_VERSION {
        return Err(LedgerError::Configuration(format!(
            "unsupported connection export version {version}"
        )));
    }
    let count = reader.read_u32::<BigEndian>()?;
    let mut definitions = Vec::new();
    for _ in 0..count {
        let name = read_string(reader)?;
        let description = read_string(reader)?;
        let class_name = read_string(reader)?;
        let config = ConfigParams::from_document(&read_string(reader)?)?;
        let max_connections = reader.read_i32::<BigEndian>()?;
        definitions.push(ConnectionDefinition {
            name,
            description,
            class_name,
            max_connections,
            config,
        });
    }
    Ok(definitions)
}

fn write_string<W: Write>(writer: &mut W, value: &str) -> Result<(), LedgerError> {
    let len = u32::try_from(value.len())
        .map_err(|_| LedgerError::Configuration("exported string too long".to_string()))?;
    writer.write_u32::<BigEndian>(len)?;
    writer.write_all(value.as_bytes())?;
    Ok(())
}

fn read_string<R: Read>(reader: &mut R) -> Result<String, LedgerError> {
    let len = u64::from(reader.read_u32::<BigEndian>()?);
    let mut bytes = Vec::new();
    reader.by_ref().take(len).read_to_end(&mut bytes)?;
    if bytes.len() as u64 != len {
        return Err(LedgerError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "truncated string in connection export",
        )));
    }
    String::from_utf8(bytes)
        .map_err(|err| LedgerError::Configuration(format!("invalid UTF-8 in connection export: {err}")))
}
