use crate::frame::frame_errors::ParseError;
use crate::frame::response::event::SchemaChangeEvent;
use crate::frame::types;
use bytes::{BufMut, Bytes};
use std::net::IpAddr;
use std::result::Result as StdResult;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetKeyspace {
    pub keyspace_name: String,
}

#[derive(Debug, Clone)]
pub struct Prepared {
    pub id: Bytes,
    pub prepared_metadata: PreparedMetadata,
    pub result_metadata: ResultMetadata,
}

#[derive(Debug, Clone)]
pub struct SchemaChange {
    pub event: SchemaChangeEvent,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableSpec {
    pub ks_name: String,
    pub table_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    Custom(String),
    Ascii,
    Boolean,
    Blob,
    Counter,
    Date,
    Decimal,
    Double,
    Duration,
    Float,
    Int,
    BigInt,
    Text,
    Timestamp,
    Inet,
    List(Box<ColumnType>),
    Map(Box<ColumnType>, Box<ColumnType>),
    Set(Box<ColumnType>),
    UserDefinedType {
        type_name: String,
        keyspace: String,
        field_types: Vec<(String, ColumnType)>,
    },
    SmallInt,
    TinyInt,
    Time,
    Timeuuid,
    Tuple(Vec<ColumnType>),
    Uuid,
    Varint,
}

/// A decoded cell.
///
/// Only the types the driver reads itself (system tables, schema versions)
/// get a native representation; everything else is kept as raw bytes
/// and left to an external deserializer.
#[derive(Clone, Debug, PartialEq)]
pub enum CqlValue {
    Ascii(String),
    Boolean(bool),
    Blob(Vec<u8>),
    Counter(i64),
    Double(f64),
    Float(f32),
    Int(i32),
    BigInt(i64),
    Text(String),
    Timestamp(i64),
    Inet(IpAddr),
    List(Vec<CqlValue>),
    Map(Vec<(CqlValue, CqlValue)>),
    Set(Vec<CqlValue>),
    SmallInt(i16),
    TinyInt(i8),
    Date(u32),
    Time(i64),
    Timeuuid(Uuid),
    Uuid(Uuid),
    Empty,
    Raw(Vec<u8>),
}

impl CqlValue {
    pub fn as_text(&self) -> Option<&String> {
        match self {
            Self::Ascii(s) | Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_string(self) -> Option<String> {
        match self {
            Self::Ascii(s) | Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Self::Uuid(u) | Self::Timeuuid(u) => Some(*u),
            _ => None,
        }
    }

    pub fn as_inet(&self) -> Option<IpAddr> {
        match self {
            Self::Inet(a) => Some(*a),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bigint(&self) -> Option<i64> {
        match self {
            Self::BigInt(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&Vec<u8>> {
        match self {
            Self::Blob(b) => Some(b),
            _ => None,
        }
    }

    pub fn into_vec(self) -> Option<Vec<CqlValue>> {
        match self {
            Self::List(v) | Self::Set(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_pair_vec(self) -> Option<Vec<(CqlValue, CqlValue)>> {
        match self {
            Self::Map(v) => Some(v),
            _ => None,
        }
    }

    /// Writes this value as `[bytes]`. Used by in-process test servers.
    pub fn serialize(&self, buf: &mut Vec<u8>) -> StdResult<(), ParseError> {
        let mut contents = Vec::new();
        match self {
            Self::Ascii(s) | Self::Text(s) => contents.extend_from_slice(s.as_bytes()),
            Self::Boolean(b) => contents.put_u8(u8::from(*b)),
            Self::Blob(b) | Self::Raw(b) => contents.extend_from_slice(b),
            Self::Counter(v) | Self::BigInt(v) | Self::Timestamp(v) | Self::Time(v) => {
                contents.put_i64(*v)
            }
            Self::Double(v) => contents.put_f64(*v),
            Self::Float(v) => contents.put_f32(*v),
            Self::Int(v) => contents.put_i32(*v),
            Self::SmallInt(v) => contents.put_i16(*v),
            Self::TinyInt(v) => contents.put_i8(*v),
            Self::Date(v) => contents.put_u32(*v),
            Self::Uuid(u) | Self::Timeuuid(u) => contents.extend_from_slice(u.as_bytes()),
            Self::Inet(IpAddr::V4(a)) => contents.extend_from_slice(&a.octets()),
            Self::Inet(IpAddr::V6(a)) => contents.extend_from_slice(&a.octets()),
            Self::List(items) | Self::Set(items) => {
                types::write_int_length(items.len(), &mut contents)?;
                for item in items {
                    item.serialize(&mut contents)?;
                }
            }
            Self::Map(pairs) => {
                types::write_int_length(pairs.len(), &mut contents)?;
                for (k, v) in pairs {
                    k.serialize(&mut contents)?;
                    v.serialize(&mut contents)?;
                }
            }
            Self::Empty => {}
        }
        types::write_bytes(&contents, buf)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub table_spec: TableSpec,
    pub name: String,
    pub typ: ColumnType,
}

#[derive(Debug, Clone, Default)]
pub struct ResultMetadata {
    pub col_count: usize,
    pub col_specs: Vec<ColumnSpec>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PartitionKeyIndex {
    /// index in the serialized values
    pub index: u16,
    /// sequence number in partition key
    pub sequence: u16,
}

#[derive(Debug, Clone, Default)]
pub struct PreparedMetadata {
    pub flags: i32,
    pub col_count: usize,
    /// pk_indexes are sorted by `index` and can be reordered in partition key order
    /// using `sequence` field
    pub pk_indexes: Vec<PartitionKeyIndex>,
    pub col_specs: Vec<ColumnSpec>,
}

#[derive(Debug, Default, PartialEq, Clone)]
pub struct Row {
    pub columns: Vec<Option<CqlValue>>,
}

#[derive(Debug, Clone)]
pub struct Rows {
    pub metadata: ResultMetadata,
    pub paging_state: Option<Bytes>,
    pub rows_count: usize,
    pub rows: Vec<Row>,
}

impl Rows {
    /// Index of the column with the given name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.metadata.col_specs.iter().position(|spec| spec.name == name)
    }
}

#[derive(Debug, Clone)]
pub enum Result {
    Void,
    Rows(Rows),
    SetKeyspace(SetKeyspace),
    Prepared(Prepared),
    SchemaChange(SchemaChange),
}

fn deser_type(buf: &mut &[u8]) -> StdResult<ColumnType, ParseError> {
    use ColumnType::*;
    let id = types::read_short(buf)?;
    Ok(match id {
        0x0000 => {
            let type_str = types::read_string(buf)?;
            match type_str {
                "org.apache.cassandra.db.marshal.DurationType" => Duration,
                _ => Custom(type_str.to_owned()),
            }
        }
        0x0001 => Ascii,
        0x0002 => BigInt,
        0x0003 => Blob,
        0x0004 => Boolean,
        0x0005 => Counter,
        0x0006 => Decimal,
        0x0007 => Double,
        0x0008 => Float,
        0x0009 => Int,
        0x000B => Timestamp,
        0x000C => Uuid,
        0x000D => Text,
        0x000E => Varint,
        0x000F => Timeuuid,
        0x0010 => Inet,
        0x0011 => Date,
        0x0012 => Time,
        0x0013 => SmallInt,
        0x0014 => TinyInt,
        0x0015 => Duration,
        0x0020 => List(Box::new(deser_type(buf)?)),
        0x0021 => Map(Box::new(deser_type(buf)?), Box::new(deser_type(buf)?)),
        0x0022 => Set(Box::new(deser_type(buf)?)),
        0x0030 => {
            let keyspace = types::read_string(buf)?.to_owned();
            let type_name = types::read_string(buf)?.to_owned();
            let fields_size: usize = types::read_short(buf)?.into();

            let mut field_types = Vec::with_capacity(fields_size);
            for _ in 0..fields_size {
                let field_name = types::read_string(buf)?.to_owned();
                let field_type = deser_type(buf)?;
                field_types.push((field_name, field_type));
            }

            UserDefinedType {
                type_name,
                keyspace,
                field_types,
            }
        }
        0x0031 => {
            let len: usize = types::read_short(buf)?.into();
            let mut types = Vec::with_capacity(len);
            for _ in 0..len {
                types.push(deser_type(buf)?);
            }
            Tuple(types)
        }
        id => {
            return Err(ParseError::TypeNotImplemented(id));
        }
    })
}

impl ColumnType {
    /// Writes the `[option]` describing this type. Used by in-process test servers.
    pub fn serialize(&self, buf: &mut Vec<u8>) -> StdResult<(), ParseError> {
        use ColumnType::*;
        let id: u16 = match self {
            Custom(name) => {
                types::write_short(0x0000, buf);
                return types::write_string(name, buf);
            }
            Ascii => 0x0001,
            BigInt => 0x0002,
            Blob => 0x0003,
            Boolean => 0x0004,
            Counter => 0x0005,
            Decimal => 0x0006,
            Double => 0x0007,
            Float => 0x0008,
            Int => 0x0009,
            Timestamp => 0x000B,
            Uuid => 0x000C,
            Text => 0x000D,
            Varint => 0x000E,
            Timeuuid => 0x000F,
            Inet => 0x0010,
            Date => 0x0011,
            Time => 0x0012,
            SmallInt => 0x0013,
            TinyInt => 0x0014,
            Duration => 0x0015,
            List(elem) | Set(elem) => {
                types::write_short(if matches!(self, List(_)) { 0x0020 } else { 0x0022 }, buf);
                return elem.serialize(buf);
            }
            Map(k, v) => {
                types::write_short(0x0021, buf);
                k.serialize(buf)?;
                return v.serialize(buf);
            }
            UserDefinedType {
                type_name,
                keyspace,
                field_types,
            } => {
                types::write_short(0x0030, buf);
                types::write_string(keyspace, buf)?;
                types::write_string(type_name, buf)?;
                types::write_short_length(field_types.len(), buf)?;
                for (name, typ) in field_types {
                    types::write_string(name, buf)?;
                    typ.serialize(buf)?;
                }
                return Ok(());
            }
            Tuple(elems) => {
                types::write_short(0x0031, buf);
                types::write_short_length(elems.len(), buf)?;
                for typ in elems {
                    typ.serialize(buf)?;
                }
                return Ok(());
            }
        };
        types::write_short(id, buf);
        Ok(())
    }
}

fn deser_table_spec(buf: &mut &[u8]) -> StdResult<TableSpec, ParseError> {
    let ks_name = types::read_string(buf)?.to_owned();
    let table_name = types::read_string(buf)?.to_owned();
    Ok(TableSpec {
        ks_name,
        table_name,
    })
}

fn deser_col_specs(
    buf: &mut &[u8],
    global_table_spec: &Option<TableSpec>,
    col_count: usize,
) -> StdResult<Vec<ColumnSpec>, ParseError> {
    let mut col_specs = Vec::with_capacity(col_count);
    for _ in 0..col_count {
        let table_spec = match global_table_spec {
            Some(spec) => spec.clone(),
            None => deser_table_spec(buf)?,
        };
        let name = types::read_string(buf)?.to_owned();
        let typ = deser_type(buf)?;
        col_specs.push(ColumnSpec {
            table_spec,
            name,
            typ,
        });
    }
    Ok(col_specs)
}

fn deser_result_metadata(
    buf: &mut &[u8],
) -> StdResult<(ResultMetadata, Option<Bytes>), ParseError> {
    let flags = types::read_int(buf)?;
    let global_tables_spec = flags & 0x0001 != 0;
    let has_more_pages = flags & 0x0002 != 0;
    let no_metadata = flags & 0x0004 != 0;

    let col_count = types::read_int_length(buf)?;

    let paging_state = if has_more_pages {
        Some(Bytes::copy_from_slice(types::read_bytes(buf)?))
    } else {
        None
    };

    if no_metadata {
        return Ok((
            ResultMetadata {
                col_count,
                col_specs: vec![],
            },
            paging_state,
        ));
    }

    let global_table_spec = if global_tables_spec {
        Some(deser_table_spec(buf)?)
    } else {
        None
    };

    let col_specs = deser_col_specs(buf, &global_table_spec, col_count)?;

    Ok((
        ResultMetadata {
            col_count,
            col_specs,
        },
        paging_state,
    ))
}

fn deser_prepared_metadata(buf: &mut &[u8]) -> StdResult<PreparedMetadata, ParseError> {
    let flags = types::read_int(buf)?;
    let global_tables_spec = flags & 0x0001 != 0;

    let col_count = types::read_int_length(buf)?;

    let pk_count: usize = types::read_int_length(buf)?;

    let mut pk_indexes = Vec::with_capacity(pk_count);
    for i in 0..pk_count {
        pk_indexes.push(PartitionKeyIndex {
            index: types::read_short(buf)?,
            sequence: i as u16,
        });
    }
    pk_indexes.sort_unstable_by_key(|pki| pki.index);

    let global_table_spec = if global_tables_spec {
        Some(deser_table_spec(buf)?)
    } else {
        None
    };

    let col_specs = deser_col_specs(buf, &global_table_spec, col_count)?;

    Ok(PreparedMetadata {
        flags,
        col_count,
        pk_indexes,
        col_specs,
    })
}

fn fixed<const N: usize>(buf: &[u8], typ: &ColumnType) -> StdResult<[u8; N], ParseError> {
    <[u8; N]>::try_from(buf).map_err(|_| {
        ParseError::BadIncomingData(format!(
            "Buffer length should be {} for {:?}, got {}",
            N,
            typ,
            buf.len()
        ))
    })
}

pub fn deser_cql_value(typ: &ColumnType, buf: &mut &[u8]) -> StdResult<CqlValue, ParseError> {
    use ColumnType::*;

    if buf.is_empty() {
        match typ {
            Ascii | Blob | Text => {
                // can't be empty
            }
            _ => return Ok(CqlValue::Empty),
        }
    }

    let contents: &[u8] = *buf;
    let value = match typ {
        Ascii => CqlValue::Ascii(std::str::from_utf8(contents)?.to_owned()),
        Text => CqlValue::Text(std::str::from_utf8(contents)?.to_owned()),
        Boolean => CqlValue::Boolean(fixed::<1>(contents, typ)?[0] != 0),
        Blob => CqlValue::Blob(contents.to_vec()),
        Counter => CqlValue::Counter(i64::from_be_bytes(fixed(contents, typ)?)),
        BigInt => CqlValue::BigInt(i64::from_be_bytes(fixed(contents, typ)?)),
        Timestamp => CqlValue::Timestamp(i64::from_be_bytes(fixed(contents, typ)?)),
        Time => CqlValue::Time(i64::from_be_bytes(fixed(contents, typ)?)),
        Double => CqlValue::Double(f64::from_be_bytes(fixed(contents, typ)?)),
        Float => CqlValue::Float(f32::from_be_bytes(fixed(contents, typ)?)),
        Int => CqlValue::Int(i32::from_be_bytes(fixed(contents, typ)?)),
        SmallInt => CqlValue::SmallInt(i16::from_be_bytes(fixed(contents, typ)?)),
        TinyInt => CqlValue::TinyInt(i8::from_be_bytes(fixed(contents, typ)?)),
        Date => CqlValue::Date(u32::from_be_bytes(fixed(contents, typ)?)),
        Uuid => CqlValue::Uuid(uuid::Uuid::from_bytes(fixed(contents, typ)?)),
        Timeuuid => CqlValue::Timeuuid(uuid::Uuid::from_bytes(fixed(contents, typ)?)),
        Inet => CqlValue::Inet(match contents.len() {
            4 => IpAddr::from(fixed::<4>(contents, typ)?),
            16 => IpAddr::from(fixed::<16>(contents, typ)?),
            len => {
                return Err(ParseError::BadIncomingData(format!(
                    "Invalid inet bytes length: {}",
                    len
                )))
            }
        }),
        List(elem) | Set(elem) => {
            let mut items_buf = contents;
            let len = types::read_int_length(&mut items_buf)?;
            let mut items = Vec::with_capacity(len);
            for _ in 0..len {
                let raw = types::read_bytes(&mut items_buf)?;
                items.push(deser_cql_value(elem, &mut &raw[..])?);
            }
            if matches!(typ, List(_)) {
                CqlValue::List(items)
            } else {
                CqlValue::Set(items)
            }
        }
        Map(key_type, value_type) => {
            let mut items_buf = contents;
            let len = types::read_int_length(&mut items_buf)?;
            let mut pairs = Vec::with_capacity(len);
            for _ in 0..len {
                let raw_key = types::read_bytes(&mut items_buf)?;
                let raw_value = types::read_bytes(&mut items_buf)?;
                pairs.push((
                    deser_cql_value(key_type, &mut &raw_key[..])?,
                    deser_cql_value(value_type, &mut &raw_value[..])?,
                ));
            }
            CqlValue::Map(pairs)
        }
        Custom(_) | Decimal | Duration | Varint | UserDefinedType { .. } | Tuple(_) => {
            CqlValue::Raw(contents.to_vec())
        }
    };
    *buf = &buf[buf.len()..];
    Ok(value)
}

fn deser_rows(buf: &mut &[u8]) -> StdResult<Rows, ParseError> {
    let (metadata, paging_state) = deser_result_metadata(buf)?;

    let rows_count: usize = types::read_int_length(buf)?;

    let mut rows = Vec::with_capacity(rows_count);
    for _ in 0..rows_count {
        let mut columns = Vec::with_capacity(metadata.col_count);
        for i in 0..metadata.col_count {
            let v = if let Some(mut b) = types::read_bytes_opt(buf)? {
                let typ = metadata
                    .col_specs
                    .get(i)
                    .map(|spec| &spec.typ)
                    .unwrap_or(&ColumnType::Blob);
                Some(deser_cql_value(typ, &mut b)?)
            } else {
                None
            };
            columns.push(v);
        }
        rows.push(Row { columns });
    }

    Ok(Rows {
        metadata,
        paging_state,
        rows_count,
        rows,
    })
}

fn deser_set_keyspace(buf: &mut &[u8]) -> StdResult<SetKeyspace, ParseError> {
    let keyspace_name = types::read_string(buf)?.to_string();

    Ok(SetKeyspace { keyspace_name })
}

fn deser_prepared(buf: &mut &[u8]) -> StdResult<Prepared, ParseError> {
    let id = Bytes::copy_from_slice(types::read_short_bytes(buf)?);
    let prepared_metadata = deser_prepared_metadata(buf)?;
    let (result_metadata, paging_state) = deser_result_metadata(buf)?;
    if paging_state.is_some() {
        return Err(ParseError::BadIncomingData(
            "Prepared response with paging state".to_owned(),
        ));
    }
    Ok(Prepared {
        id,
        prepared_metadata,
        result_metadata,
    })
}

fn deser_schema_change(buf: &mut &[u8]) -> StdResult<SchemaChange, ParseError> {
    Ok(SchemaChange {
        event: SchemaChangeEvent::deserialize(buf)?,
    })
}

pub fn deserialize(buf: &mut &[u8]) -> StdResult<Result, ParseError> {
    Ok(match types::read_int(buf)? {
        0x0001 => Result::Void,
        0x0002 => Result::Rows(deser_rows(buf)?),
        0x0003 => Result::SetKeyspace(deser_set_keyspace(buf)?),
        0x0004 => Result::Prepared(deser_prepared(buf)?),
        0x0005 => Result::SchemaChange(deser_schema_change(buf)?),
        k => {
            return Err(ParseError::BadIncomingData(format!(
                "Unknown query result id: {}",
                k
            )))
        }
    })
}

fn serialize_col_specs(specs: &[ColumnSpec], buf: &mut Vec<u8>) -> StdResult<(), ParseError> {
    for spec in specs {
        types::write_string(&spec.table_spec.ks_name, buf)?;
        types::write_string(&spec.table_spec.table_name, buf)?;
        types::write_string(&spec.name, buf)?;
        spec.typ.serialize(buf)?;
    }
    Ok(())
}

impl Result {
    /// Writes the body of a RESULT response. Used by in-process test servers.
    pub fn serialize(&self, buf: &mut Vec<u8>) -> StdResult<(), ParseError> {
        match self {
            Result::Void => types::write_int(0x0001, buf),
            Result::Rows(rows) => {
                types::write_int(0x0002, buf);
                let flags = if rows.paging_state.is_some() { 0x0002 } else { 0 };
                types::write_int(flags, buf);
                types::write_int_length(rows.metadata.col_specs.len(), buf)?;
                if let Some(state) = &rows.paging_state {
                    types::write_bytes(state, buf)?;
                }
                serialize_col_specs(&rows.metadata.col_specs, buf)?;
                types::write_int_length(rows.rows.len(), buf)?;
                for row in &rows.rows {
                    for cell in &row.columns {
                        match cell {
                            Some(v) => v.serialize(buf)?,
                            None => types::write_int(-1, buf),
                        }
                    }
                }
            }
            Result::SetKeyspace(set) => {
                types::write_int(0x0003, buf);
                types::write_string(&set.keyspace_name, buf)?;
            }
            Result::Prepared(prepared) => {
                types::write_int(0x0004, buf);
                types::write_short_bytes(&prepared.id, buf)?;
                let meta = &prepared.prepared_metadata;
                types::write_int(0, buf);
                types::write_int_length(meta.col_specs.len(), buf)?;
                let mut pk = meta.pk_indexes.clone();
                pk.sort_unstable_by_key(|pki| pki.sequence);
                types::write_int_length(pk.len(), buf)?;
                for pki in pk {
                    types::write_short(pki.index, buf);
                }
                serialize_col_specs(&meta.col_specs, buf)?;
                // Result metadata is omitted.
                types::write_int(0x0004, buf);
                types::write_int(0, buf);
            }
            Result::SchemaChange(change) => {
                types::write_int(0x0005, buf);
                change.event.serialize(buf)?;
            }
        }
        Ok(())
    }
}
