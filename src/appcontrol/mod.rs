//! The concrete protocol built on top of the generic engine: schema,
//! shared constants, and the server/client state machines (spec §4.7).

pub mod client;
pub mod server;

use crate::framing::FieldType;
use crate::protocol::{schema_entry, Schema};
use std::collections::HashMap;

pub const SIGNATURE: &str = "APPCTRL";

pub const MAJOR_VERSION: i64 = 1;
pub const MINOR_VERSION: i64 = 0;

/// The positional schema table from spec §4.7. `keep-alive-req`/
/// `keep-alive-rep` are handled by the engine itself and carry no fields, so
/// they are intentionally absent here.
pub fn schema() -> Schema {
    HashMap::from([
        schema_entry("HOWDY", &[
            ("user", FieldType::Str),
            ("major", FieldType::Int),
            ("minor", FieldType::Int),
        ]),
        schema_entry("HI", &[
            ("major", FieldType::Int),
            ("minor", FieldType::Int),
            ("state", FieldType::Str),
            ("file_name", FieldType::Str),
            ("md5", FieldType::Str),
            ("label", FieldType::Str),
        ]),
        schema_entry("LOAD", &[
            ("file_name", FieldType::Str),
            ("md5", FieldType::Str),
            ("label", FieldType::Str),
        ]),
        schema_entry("LOAD_READY", &[
            ("file_name", FieldType::Str),
            ("md5", FieldType::Str),
            ("label", FieldType::Str),
        ]),
        schema_entry("CHUNK", &[
            ("is_last", FieldType::Bool),
            ("data", FieldType::Bytes),
        ]),
        schema_entry("CHUNK_OK", &[]),
        schema_entry("LOAD_OK", &[
            ("file_name", FieldType::Str),
            ("md5", FieldType::Str),
            ("label", FieldType::Str),
        ]),
        schema_entry("RUN", &[("command", FieldType::Str)]),
        schema_entry("RUN_OK", &[]),
        schema_entry("STOP", &[]),
        schema_entry("STOP_OK", &[]),
        schema_entry("EVENT", &[
            ("event_type", FieldType::Str),
            ("event_name", FieldType::Str),
            ("timestamp", FieldType::Str),
            ("data_type", FieldType::Str),
            ("data", FieldType::Str),
        ]),
        schema_entry("FINISHED", &[("exit_code", FieldType::Int)]),
        schema_entry("ERROR", &[("message", FieldType::Str)]),
        schema_entry("QUIT", &[]),
    ])
}
